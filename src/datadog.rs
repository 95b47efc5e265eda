//! Dead-letter payload of the Datadog sink.
//!
//! When a batch of events can't be delivered to the Datadog logs API
//! the sink emits one [`DatadogWriteError`] per event, holding the
//! event and whatever the API answered.

use std::io::Read;
use std::io::Write;

use serde::Deserialize;
use serde::Serialize;

use crate::coders::BigEndianIntCoder;
use crate::coders::Coder;
use crate::coders::CoderError;
use crate::coders::NullableCoder;
use crate::coders::StringUtf8Coder;

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatadogWriteError {
    payload: Option<String>,
    status_code: Option<i32>,
    status_message: Option<String>,
}

impl DatadogWriteError {
    pub fn builder() -> DatadogWriteErrorBuilder {
        DatadogWriteErrorBuilder::default()
    }

    pub fn payload(&self) -> Option<&str> {
        self.payload.as_deref()
    }

    pub fn status_code(&self) -> Option<i32> {
        self.status_code
    }

    pub fn status_message(&self) -> Option<&str> {
        self.status_message.as_deref()
    }
}

#[derive(Debug, Default)]
pub struct DatadogWriteErrorBuilder {
    inner: DatadogWriteError,
}

impl DatadogWriteErrorBuilder {
    pub fn with_payload(mut self, payload: impl Into<String>) -> Self {
        self.inner.payload = Some(payload.into());
        self
    }

    pub fn with_status_code(mut self, status_code: i32) -> Self {
        self.inner.status_code = Some(status_code);
        self
    }

    pub fn with_status_message(mut self, status_message: impl Into<String>) -> Self {
        self.inner.status_message = Some(status_message.into());
        self
    }

    pub fn build(self) -> DatadogWriteError {
        self.inner
    }
}

const STRING_FIELD: NullableCoder<StringUtf8Coder> = NullableCoder(StringUtf8Coder);
const INT_FIELD: NullableCoder<BigEndianIntCoder> = NullableCoder(BigEndianIntCoder);

/// Payload, status code and status message, each nullable, in that
/// order.
#[derive(Debug, Clone, Copy, Default)]
pub struct DatadogWriteErrorCoder;

impl DatadogWriteErrorCoder {
    pub fn of() -> Self {
        Self
    }
}

impl Coder for DatadogWriteErrorCoder {
    type Value = DatadogWriteError;

    fn encode(&self, value: &DatadogWriteError, out: &mut dyn Write) -> Result<(), CoderError> {
        STRING_FIELD.encode(&value.payload, out)?;
        INT_FIELD.encode(&value.status_code, out)?;
        STRING_FIELD.encode(&value.status_message, out)
    }

    fn decode(&self, input: &mut dyn Read) -> Result<DatadogWriteError, CoderError> {
        Ok(DatadogWriteError {
            payload: STRING_FIELD.decode(input)?,
            status_code: INT_FIELD.decode(input)?,
            status_message: STRING_FIELD.decode(input)?,
        })
    }
}

#[test]
fn datadog_write_error_survives_coding() {
    let error = DatadogWriteError::builder()
        .with_payload("test-payload")
        .with_status_code(123)
        .with_status_message("test-message")
        .build();

    let coder = DatadogWriteErrorCoder::of();
    let bytes = coder.encode_to_vec(&error).unwrap();

    assert_eq!(coder.decode_from_slice(&bytes).unwrap(), error);
}

#[test]
fn datadog_write_error_missing_fields_are_markers() {
    let error = DatadogWriteError::builder().with_status_code(503).build();

    let bytes = DatadogWriteErrorCoder.encode_to_vec(&error).unwrap();

    assert_eq!(bytes, vec![0x00, 0x01, 0, 0, 0x01, 0xf7, 0x00]);
    assert_eq!(error.payload(), None);
    assert_eq!(error.status_code(), Some(503));
}
