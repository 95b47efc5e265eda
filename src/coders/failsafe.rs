use std::io::Read;
use std::io::Write;

use super::Coder;
use super::CoderError;
use super::NullableCoder;
use super::StringUtf8Coder;
use crate::values::FailsafeElement;

const ERROR_FIELD: NullableCoder<StringUtf8Coder> = NullableCoder(StringUtf8Coder);

/// Coder for [`FailsafeElement`] built from one coder for the original
/// payload and one for the current payload.
///
/// Layout, in order: the original payload, the current payload, then
/// the error message and the stacktrace, each as a nullable UTF-8
/// string.
#[derive(Debug, Clone, Copy, Default)]
pub struct FailsafeElementCoder<OC, CC> {
    original: OC,
    payload: CC,
}

impl<OC, CC> FailsafeElementCoder<OC, CC> {
    pub fn of(original: OC, payload: CC) -> Self {
        Self { original, payload }
    }
}

impl<OC, CC> Coder for FailsafeElementCoder<OC, CC>
where
    OC: Coder,
    CC: Coder,
{
    type Value = FailsafeElement<OC::Value, CC::Value>;

    fn encode(&self, value: &Self::Value, out: &mut dyn Write) -> Result<(), CoderError> {
        self.original.encode(value.original_payload(), out)?;
        self.payload.encode(value.payload(), out)?;
        ERROR_FIELD.encode(&value.error_message().map(str::to_string), out)?;
        ERROR_FIELD.encode(&value.stacktrace().map(str::to_string), out)?;
        Ok(())
    }

    fn decode(&self, input: &mut dyn Read) -> Result<Self::Value, CoderError> {
        let original = self.original.decode(input)?;
        let payload = self.payload.decode(input)?;
        let error_message = ERROR_FIELD.decode(input)?;
        let stacktrace = ERROR_FIELD.decode(input)?;

        let mut element = FailsafeElement::of(original, payload);
        if let Some(error_message) = error_message {
            element = element.with_error_message(error_message);
        }
        if let Some(stacktrace) = stacktrace {
            element = element.with_stacktrace(stacktrace);
        }
        Ok(element)
    }

    fn verify_deterministic(&self) -> Result<(), CoderError> {
        self.original.verify_deterministic()?;
        self.payload.verify_deterministic()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coders::BincodeCoder;
    use crate::coders::ByteArrayCoder;

    fn string_coder() -> FailsafeElementCoder<StringUtf8Coder, StringUtf8Coder> {
        FailsafeElementCoder::of(StringUtf8Coder, StringUtf8Coder)
    }

    #[test]
    fn failed_parse_survives_coding() {
        let element = FailsafeElement::of("raw-123".to_string(), "raw-123".to_string())
            .with_error_message("parse failure")
            .with_stacktrace("at line 4");

        let bytes = string_coder().encode_to_vec(&element).unwrap();
        let decoded = string_coder().decode_from_slice(&bytes).unwrap();

        assert_eq!(decoded, element);
        assert_eq!(decoded.original_payload(), "raw-123");
        assert_eq!(decoded.error_message(), Some("parse failure"));
        assert_eq!(decoded.stacktrace(), Some("at line 4"));
    }

    #[test]
    fn layout_is_fields_in_order() {
        let element = FailsafeElement::of("ab".to_string(), "c".to_string()).with_error_message("e");

        let bytes = string_coder().encode_to_vec(&element).unwrap();

        assert_eq!(
            bytes,
            vec![2, b'a', b'b', 1, b'c', 0x01, 1, b'e', 0x00]
        );
    }

    #[test]
    fn clean_byte_payload_survives_coding() {
        let coder = FailsafeElementCoder::of(ByteArrayCoder, StringUtf8Coder);
        let element = FailsafeElement::of(vec![0u8, 159, 146, 150], "decoded".to_string());

        let bytes = coder.encode_to_vec(&element).unwrap();
        let decoded = coder.decode_from_slice(&bytes).unwrap();

        assert_eq!(decoded, element);
        assert!(!decoded.is_failed());
        assert_eq!(decoded.stacktrace(), None);
    }

    #[test]
    fn truncated_element_is_an_error() {
        let element = FailsafeElement::wrap("raw".to_string()).with_error_message("bad");
        let bytes = string_coder().encode_to_vec(&element).unwrap();

        for cut in 0..bytes.len() {
            assert!(
                string_coder().decode_from_slice(&bytes[..cut]).is_err(),
                "decoding {cut} of {} bytes should fail",
                bytes.len()
            );
        }
    }

    fn random_text(rng: &fastrand::Rng) -> String {
        const CHARS: &[char] = &['a', 'Z', '0', ' ', '\n', '>', 'é', 'ß', '中', '😀'];
        let len = rng.usize(..40);
        std::iter::repeat_with(|| CHARS[rng.usize(..CHARS.len())])
            .take(len)
            .collect()
    }

    /// `None`, `Some("")` or some text, picked independently per call.
    fn random_field(rng: &fastrand::Rng) -> Option<String> {
        match rng.u8(..3) {
            0 => None,
            1 => Some(String::new()),
            _ => Some(random_text(rng)),
        }
    }

    #[test]
    fn random_elements_survive_coding() {
        let rng = fastrand::Rng::with_seed(7);
        let coder = FailsafeElementCoder::of(ByteArrayCoder, StringUtf8Coder);
        for _ in 0..200 {
            let len = rng.usize(..64);
            let original: Vec<u8> = std::iter::repeat_with(|| rng.u8(..)).take(len).collect();
            let mut element = FailsafeElement::of(original, random_text(&rng));
            if let Some(error_message) = random_field(&rng) {
                element = element.with_error_message(error_message);
            }
            if let Some(stacktrace) = random_field(&rng) {
                element = element.with_stacktrace(stacktrace);
            }

            let bytes = coder.encode_to_vec(&element).unwrap();
            assert_eq!(coder.decode_from_slice(&bytes).unwrap(), element);
        }
    }

    #[test]
    fn empty_error_fields_are_not_absent() {
        let element = FailsafeElement::wrap("raw".to_string())
            .with_error_message("")
            .with_stacktrace("");

        let bytes = string_coder().encode_to_vec(&element).unwrap();
        let decoded = string_coder().decode_from_slice(&bytes).unwrap();

        assert_eq!(decoded.error_message(), Some(""));
        assert_eq!(decoded.stacktrace(), Some(""));
    }

    #[test]
    fn deterministic_only_if_both_payload_coders_are() {
        assert!(string_coder().verify_deterministic().is_ok());
        assert!(
            FailsafeElementCoder::of(StringUtf8Coder, BincodeCoder::<Vec<u32>>::new())
                .verify_deterministic()
                .is_err()
        );
        assert!(
            FailsafeElementCoder::of(BincodeCoder::<u8>::new(), ByteArrayCoder)
                .verify_deterministic()
                .is_err()
        );
    }
}
