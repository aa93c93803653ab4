//! Bucket key generation.

/// Prefix shared by every bucket record in the store.
pub const KEY_PREFIX: &str = "rate_limit";

/// A key that uniquely identifies a bucket: one per (principal, resource).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketKey {
    /// The principal the quota is scoped to
    pub principal_id: String,
    /// The resource being accessed
    pub resource: String,
}

impl BucketKey {
    /// Create a new bucket key.
    pub fn new(principal_id: &str, resource: &str) -> Self {
        Self {
            principal_id: principal_id.to_string(),
            resource: resource.to_string(),
        }
    }

    /// The key under which the bucket is stored.
    ///
    /// Format: `rate_limit:{principal_id}:{resource}`
    pub fn to_store_key(&self) -> String {
        format!("{}:{}:{}", KEY_PREFIX, self.principal_id, self.resource)
    }
}

impl std::fmt::Display for BucketKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_store_key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_key_format() {
        let key = BucketKey::new("user-42", "/api/search");
        assert_eq!(key.to_store_key(), "rate_limit:user-42:/api/search");
        assert_eq!(key.to_string(), "rate_limit:user-42:/api/search");
    }

    #[test]
    fn test_key_equality() {
        assert_eq!(BucketKey::new("a", "r"), BucketKey::new("a", "r"));
        assert_ne!(BucketKey::new("a", "r1"), BucketKey::new("a", "r2"));
        assert_ne!(BucketKey::new("a1", "r"), BucketKey::new("a2", "r"));
    }
}
