//! Signup record codec.
//!
//! Records travel as compact JSON objects with the fields in declaration
//! order, so encoding is deterministic. Decoding is all-or-nothing: a payload
//! missing `email`, `username` or `password` is rejected, a missing `id`
//! decodes as zero, unknown extra fields are ignored.

use thiserror::Error;

use super::types::SignupRecord;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to encode signup record: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("malformed signup payload: {0}")]
    Decode(#[source] serde_json::Error),
}

/// Serialize a record into its channel payload.
pub fn encode(record: &SignupRecord) -> Result<Vec<u8>, CodecError> {
    serde_json::to_vec(record).map_err(CodecError::Encode)
}

/// Parse a channel payload back into a record.
pub fn decode(data: &[u8]) -> Result<SignupRecord, CodecError> {
    serde_json::from_slice(data).map_err(CodecError::Decode)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let record = SignupRecord::new(1, "a@b.com", "alice", "x");

        let bytes = encode(&record).unwrap();
        assert_eq!(decode(&bytes).unwrap(), record);
    }

    #[test]
    fn test_encode_is_deterministic() {
        let record = SignupRecord::new(42, "bob@example.com", "bob", "s3cret");

        let bytes = encode(&record).unwrap();
        assert_eq!(bytes, encode(&record).unwrap());
        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            r#"{"id":42,"email":"bob@example.com","username":"bob","password":"s3cret"}"#
        );
    }

    #[test]
    fn test_decode_accepts_browser_payload() {
        let json = r#"{"id": 3, "email": "c@d.com", "username": "carol", "password": "pw", "extra": true}"#;

        let record = decode(json.as_bytes()).unwrap();
        assert_eq!(record.id, 3);
        assert_eq!(record.username, "carol");
    }

    #[test]
    fn test_decode_defaults_missing_id_to_zero() {
        let json = r#"{"email": "a@b.com", "username": "alice", "password": "x"}"#;

        let record = decode(json.as_bytes()).unwrap();
        assert_eq!(record, SignupRecord::new(0, "a@b.com", "alice", "x"));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(decode(b"not json"), Err(CodecError::Decode(_))));
        assert!(matches!(decode(b""), Err(CodecError::Decode(_))));
        assert!(matches!(decode(b"[1,2,3]"), Err(CodecError::Decode(_))));
    }

    #[test]
    fn test_decode_rejects_missing_field() {
        let json = r#"{"id": 1, "email": "a@b.com", "username": "alice"}"#;
        assert!(matches!(decode(json.as_bytes()), Err(CodecError::Decode(_))));
    }

    #[test]
    fn test_decode_rejects_wrong_type() {
        let json = r#"{"id": "one", "email": "a@b.com", "username": "alice", "password": "x"}"#;
        assert!(decode(json.as_bytes()).is_err());
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(512))]

            #[test]
            fn round_trip_any_record(
                id in any::<i64>(),
                email in any::<String>(),
                username in any::<String>(),
                password in any::<String>(),
            ) {
                let record = SignupRecord::new(id, email, username, password);
                let bytes = encode(&record).unwrap();
                prop_assert_eq!(decode(&bytes).unwrap(), record);
            }

            #[test]
            fn round_trip_escape_heavy_strings(
                id in prop_oneof![Just(i64::MIN), Just(i64::MAX), Just(0i64), Just(-1i64)],
                text in r#"["\\/\x00-\x1f\x7fé漢😀 ]{0,32}"#,
            ) {
                let record = SignupRecord::new(id, text.clone(), text.clone(), text);
                let bytes = encode(&record).unwrap();
                prop_assert_eq!(decode(&bytes).unwrap(), record);
            }
        }
    }
}
