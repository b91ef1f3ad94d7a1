use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// 响应缓存条目
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct CacheEntry {
    #[serde(with = "base64_payload")]
    pub payload: Vec<u8>,
    pub content_type: String,
    pub status_code: u16,
    pub created_at: i64, // Unix timestamp, milliseconds
    pub ttl_secs: u64,
    pub version: String,
}

impl CacheEntry {
    pub fn new(
        payload: Vec<u8>,
        content_type: impl Into<String>,
        status_code: u16,
        created_at: i64,
        ttl_secs: u64,
    ) -> Self {
        Self {
            payload,
            content_type: content_type.into(),
            status_code,
            created_at,
            ttl_secs,
            version: uuid::Uuid::new_v4().to_string(),
        }
    }

    pub fn expires_at(&self) -> i64 {
        self.created_at
            .saturating_add((self.ttl_secs as i64).saturating_mul(1000))
    }

    /// 读取时二次校验年龄，不依赖存储过期的精度
    pub fn is_fresh(&self, now_millis: i64) -> bool {
        now_millis < self.expires_at()
    }

    pub fn decode(key: &str, raw: &str) -> Result<Self, StoreError> {
        let entry: CacheEntry =
            serde_json::from_str(raw).map_err(|e| StoreError::inconsistent(key, e))?;
        if !(100..=599).contains(&entry.status_code) {
            return Err(StoreError::inconsistent(
                key,
                format!("status code {} out of range", entry.status_code),
            ));
        }
        Ok(entry)
    }

    pub fn encode(&self) -> Result<String, StoreError> {
        serde_json::to_string(self).map_err(|e| StoreError::inconsistent("cache entry", e))
    }
}

mod base64_payload {
    use base64::{Engine, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_survives_encoding_byte_for_byte() {
        let payload = vec![0u8, 159, 146, 150, b'{', b'}'];
        let entry = CacheEntry::new(payload.clone(), "application/octet-stream", 200, 5, 30);
        let decoded = CacheEntry::decode("k", &entry.encode().unwrap()).unwrap();
        assert_eq!(decoded.payload, payload);
        assert_eq!(decoded, entry);
    }

    #[test]
    fn freshness_boundary() {
        let entry = CacheEntry::new(Vec::new(), "text/plain", 200, 1_000, 30);
        assert!(entry.is_fresh(30_999));
        assert!(!entry.is_fresh(31_000));
    }

    #[test]
    fn decode_rejects_bad_status_and_payload() {
        let raw = r#"{"payload":"","content_type":"","status_code":42,"created_at":0,"ttl_secs":1,"version":"v"}"#;
        assert!(CacheEntry::decode("k", raw).is_err());
        let raw = r#"{"payload":"***","content_type":"","status_code":200,"created_at":0,"ttl_secs":1,"version":"v"}"#;
        assert!(CacheEntry::decode("k", raw).is_err());
    }
}
