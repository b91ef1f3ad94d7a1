/// 限流桶键前缀
const RATE_LIMIT_PREFIX: &str = "rate_limit:";

/// 限流范围：调用方身份 + 可选的路由类别
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketKey {
    pub identity: String,
    pub class: Option<String>,
}

impl BucketKey {
    pub fn new(identity: impl Into<String>, class: Option<&str>) -> Self {
        Self {
            identity: identity.into(),
            class: class.map(str::to_string),
        }
    }

    /// 存储键：`rate_limit:{class}:{identity}`，无类别时类别段为空
    pub fn store_key(&self) -> String {
        format!(
            "{}{}:{}",
            RATE_LIMIT_PREFIX,
            self.class.as_deref().unwrap_or_default(),
            self.identity
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_identity_gets_a_bucket_per_class() {
        let products = BucketKey::new("ip:10.0.0.1", Some("products"));
        let orders = BucketKey::new("ip:10.0.0.1", Some("orders"));
        assert_eq!(products.store_key(), "rate_limit:products:ip:10.0.0.1");
        assert_ne!(products.store_key(), orders.store_key());
        assert_eq!(
            BucketKey::new("ip:10.0.0.1", None).store_key(),
            "rate_limit::ip:10.0.0.1"
        );
    }
}
