//! Where failed elements end up.
//!
//! Failed [`FailsafeElement`]s are encoded with a deterministic
//! [`Coder`] into a [`DeadLetterRecord`] and handed to a
//! [`DeadLetterWriter`] in batches, one batch per epoch. Records are
//! identified by their step and the hash of their encoded bytes, so
//! writing the same failure twice only bumps its occurrence count.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

use crate::coders::Coder;
use crate::coders::CoderError;
use crate::dataflow::StepId;
use crate::errors::TrackedError;
use crate::values::FailsafeElement;

mod sqlite;

pub use sqlite::SqliteDeadLetterStore;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub step_id: StepId,
    /// Seahash of `element`.
    pub fingerprint: u64,
    /// The failed element, as encoded by the step's coder.
    pub element: Vec<u8>,
    pub error_message: Option<String>,
    pub stacktrace: Option<String>,
    /// When this failure was last seen.
    pub failed_at: DateTime<Utc>,
    pub occurrences: u64,
}

impl DeadLetterRecord {
    pub fn encode<C, O, P>(
        step_id: StepId,
        coder: &C,
        element: &FailsafeElement<O, P>,
        failed_at: DateTime<Utc>,
    ) -> Result<Self, CoderError>
    where
        C: Coder<Value = FailsafeElement<O, P>>,
    {
        let bytes = coder.encode_to_vec(element)?;
        Ok(Self {
            step_id,
            fingerprint: seahash::hash(&bytes),
            element: bytes,
            error_message: element.error_message().map(str::to_string),
            stacktrace: element.stacktrace().map(str::to_string),
            failed_at,
            occurrences: 1,
        })
    }

    /// Decode the stored element with the coder it was written with.
    pub fn decode<C>(&self, coder: &C) -> Result<C::Value, CoderError>
    where
        C: Coder,
    {
        coder.decode_from_slice(&self.element)
    }
}

/// A sink for dead letters.
pub trait DeadLetterWriter {
    /// Durably store all records or return an error.
    fn write_batch(&mut self, records: Vec<DeadLetterRecord>) -> Result<(), TrackedError>;
}

impl<W> DeadLetterWriter for Box<W>
where
    W: DeadLetterWriter + ?Sized,
{
    fn write_batch(&mut self, records: Vec<DeadLetterRecord>) -> Result<(), TrackedError> {
        (**self).write_batch(records)
    }
}

/// Keeps dead letters in memory. Clones share the same records, so a
/// test can keep one handle and give another to each worker.
#[derive(Debug, Clone, Default)]
pub struct InMemDeadLetters {
    records: Arc<Mutex<Vec<DeadLetterRecord>>>,
}

impl InMemDeadLetters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all records in the order they were first written.
    pub fn records(&self) -> Vec<DeadLetterRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl DeadLetterWriter for InMemDeadLetters {
    fn write_batch(&mut self, batch: Vec<DeadLetterRecord>) -> Result<(), TrackedError> {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        let mut index: HashMap<(StepId, u64), usize> = records
            .iter()
            .enumerate()
            .map(|(i, rec)| ((rec.step_id.clone(), rec.fingerprint), i))
            .collect();
        for record in batch {
            tracing::trace!("Writing dead letter {record:?}");
            let key = (record.step_id.clone(), record.fingerprint);
            match index.get(&key) {
                Some(&i) => {
                    let existing = &mut records[i];
                    existing.occurrences += record.occurrences;
                    existing.failed_at = record.failed_at;
                    existing.error_message = record.error_message;
                    existing.stacktrace = record.stacktrace;
                }
                None => {
                    index.insert(key, records.len());
                    records.push(record);
                }
            }
        }
        Ok(())
    }
}
