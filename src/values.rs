//! The value type that carries a record and its failure context
//! through a pipeline.

use std::fmt;

use serde::Deserialize;
use serde::Serialize;

/// Holds the current value and the original value of a record within
/// a pipeline.
///
/// Keeping the original around means a stage that fails several
/// transformations downstream can still route the record, as it was
/// ingested, to a dead-letter sink along with the error that
/// happened.
///
/// Elements are never modified in place. Every `with_*` method
/// consumes the element and returns a new one, so an element handed
/// to one stage can't be altered by another.
///
/// Equality and hashing are structural over all four fields.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailsafeElement<O, C> {
    original_payload: O,
    payload: C,
    error_message: Option<String>,
    stacktrace: Option<String>,
}

impl<O, C> FailsafeElement<O, C> {
    /// Pair an original payload with a current payload. No error
    /// fields are set.
    pub fn of(original_payload: O, payload: C) -> Self {
        Self {
            original_payload,
            payload,
            error_message: None,
            stacktrace: None,
        }
    }

    /// Copy another element, including its error fields.
    pub fn copy_of(other: &Self) -> Self
    where
        O: Clone,
        C: Clone,
    {
        Self {
            original_payload: other.original_payload.clone(),
            payload: other.payload.clone(),
            error_message: other.error_message.clone(),
            stacktrace: other.stacktrace.clone(),
        }
    }

    pub fn original_payload(&self) -> &O {
        &self.original_payload
    }

    pub fn payload(&self) -> &C {
        &self.payload
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    pub fn stacktrace(&self) -> Option<&str> {
        self.stacktrace.as_deref()
    }

    /// Whether a failure handler has annotated this element.
    pub fn is_failed(&self) -> bool {
        self.error_message.is_some()
    }

    pub fn with_error_message(self, error_message: impl Into<String>) -> Self {
        Self {
            error_message: Some(error_message.into()),
            ..self
        }
    }

    pub fn with_stacktrace(self, stacktrace: impl Into<String>) -> Self {
        Self {
            stacktrace: Some(stacktrace.into()),
            ..self
        }
    }

    /// Replace the current payload, keeping the original payload and
    /// any error fields.
    pub fn with_payload<N>(self, payload: N) -> FailsafeElement<O, N> {
        FailsafeElement {
            original_payload: self.original_payload,
            payload,
            error_message: self.error_message,
            stacktrace: self.stacktrace,
        }
    }

    /// Discard the wrapper, keeping only the current payload.
    pub fn into_payload(self) -> C {
        self.payload
    }

    /// Break the element into `(original, payload, error_message,
    /// stacktrace)`.
    pub fn into_parts(self) -> (O, C, Option<String>, Option<String>) {
        (
            self.original_payload,
            self.payload,
            self.error_message,
            self.stacktrace,
        )
    }
}

impl<T: Clone> FailsafeElement<T, T> {
    /// Wrap a freshly ingested record. Original and current payload
    /// start out equal.
    pub fn wrap(record: T) -> Self {
        Self::of(record.clone(), record)
    }
}

impl<O, C> fmt::Display for FailsafeElement<O, C>
where
    O: fmt::Debug,
    C: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "FailsafeElement{{originalPayload={:?}, payload={:?}, errorMessage={:?}, stacktrace={:?}}}",
            self.original_payload, self.payload, self.error_message, self.stacktrace
        )
    }
}
