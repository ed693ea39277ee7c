//! Serde integration for [`HyperLogLog`], behind the `with_serde` feature.
//!
//! An estimator serializes as its engine-native byte form (see the codec
//! module), so any serde format carries exactly the bytes the engine would
//! persist on its own, and deserialization goes through the same strict
//! validation — a malformed payload surfaces as a serde error, never as a
//! partially built estimator.

use serde::de::Error;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::estimator::HyperLogLog;

impl Serialize for HyperLogLog {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(&self.to_bytes())
    }
}

impl<'de> Deserialize<'de> for HyperLogLog {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let bytes: Vec<u8> = Deserialize::deserialize(deserializer)?;
        HyperLogLog::from_bytes(&bytes).map_err(|e| Error::custom(e.to_string()))
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::estimator::Encoding;
    use test_case::test_case;

    #[test_case(0; "empty set")]
    #[test_case(1; "single element")]
    #[test_case(2; "two distinct elements")]
    #[test_case(100; "hundred distinct elements")]
    #[test_case(10000; "ten thousand distinct elements")]
    fn test_serde(n: usize) {
        let mut original = HyperLogLog::builder().build().unwrap();
        for i in 0..n {
            original.add_str(&format!("item{}", i));
        }

        let serialized = serde_json::to_string(&original).expect("serialization failed");
        assert!(
            !serialized.is_empty(),
            "serialized string should not be empty"
        );

        let deserialized: HyperLogLog =
            serde_json::from_str(&serialized).expect("deserialization failed");

        assert_eq!(deserialized, original);
        assert_eq!(deserialized.encoding(), original.encoding());
        assert_eq!(deserialized.count(), original.count());
    }

    #[test]
    fn test_serde_dense() {
        let mut original = HyperLogLog::builder()
            .register_index_bits(10)
            .build()
            .unwrap();
        for i in 0..5_000_i64 {
            original.add_i64(i);
        }
        assert_eq!(original.encoding(), Encoding::Dense);

        let serialized = serde_json::to_vec(&original).expect("serialization failed");
        let deserialized: HyperLogLog =
            serde_json::from_slice(&serialized).expect("deserialization failed");
        assert_eq!(deserialized, original);
        assert_eq!(deserialized.count(), original.count());
    }

    #[test]
    fn test_deserialize_invalid_json() {
        let invalid_json = "{ invalid_json_string }";
        let result: Result<HyperLogLog, _> = serde_json::from_str(invalid_json);
        assert!(
            result.is_err(),
            "deserialization should fail for invalid JSON"
        );
    }

    #[test]
    fn test_deserialize_malformed_payload() {
        // Valid JSON byte arrays that are not valid estimator payloads.
        for input in ["[]", "[1]", "[1,14,0]", "[9,14,1,6,0,0,0,0]"] {
            let result: Result<HyperLogLog, _> = serde_json::from_str(input);
            assert!(result.is_err(), "input {input:?} should not deserialize");
        }
    }
}
