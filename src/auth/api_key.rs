//! API key authentication
//!
//! Keys are formatted as `vn_<random>` and only their SHA-256 hash is kept.

use std::collections::HashMap;
use std::sync::RwLock;

use uuid::Uuid;

use super::{AuthContext, AuthError};
use crate::crypto::sha256_hex;
use crate::domain::UserId;

/// API key prefix
pub const API_KEY_PREFIX: &str = "vn_";

/// API key metadata
#[derive(Debug, Clone)]
pub struct ApiKeyRecord {
    /// Hash of the API key (never store plaintext)
    pub key_hash: String,

    /// Identity this key authenticates as
    pub user_id: UserId,

    /// Whether the key is active
    pub active: bool,
}

/// API key validator
pub struct ApiKeyValidator {
    keys: RwLock<HashMap<String, ApiKeyRecord>>,
}

impl ApiKeyValidator {
    pub fn new() -> Self {
        Self {
            keys: RwLock::new(HashMap::new()),
        }
    }

    /// Build a validator from `key:user_uuid,key:user_uuid`
    pub fn parse(entries: &str) -> Result<Self, AuthError> {
        let validator = Self::new();
        for pair in entries.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let (key, user) = pair
                .split_once(':')
                .ok_or_else(|| AuthError::InvalidConfig(format!("expected key:user, got {pair:?}")))?;
            let key = key.trim();
            if !key.starts_with(API_KEY_PREFIX) {
                return Err(AuthError::InvalidConfig(format!(
                    "API keys must start with {API_KEY_PREFIX}"
                )));
            }
            let user = Uuid::parse_str(user.trim())
                .map_err(|e| AuthError::InvalidConfig(format!("invalid user id: {e}")))?;
            validator.register_key(ApiKeyRecord {
                key_hash: Self::hash_key(key),
                user_id: UserId::from_uuid(user),
                active: true,
            });
        }
        Ok(validator)
    }

    /// Generate a new API key
    ///
    /// Returns (plaintext_key, key_hash)
    pub fn generate_key() -> (String, String) {
        use rand::Rng;
        let random_bytes: [u8; 24] = rand::thread_rng().gen();
        let random_part = base64::Engine::encode(
            &base64::engine::general_purpose::URL_SAFE_NO_PAD,
            random_bytes,
        );

        let plaintext_key = format!("{API_KEY_PREFIX}{random_part}");
        let key_hash = Self::hash_key(&plaintext_key);

        (plaintext_key, key_hash)
    }

    /// Hash an API key for storage
    pub fn hash_key(key: &str) -> String {
        sha256_hex(key.as_bytes())
    }

    pub fn register_key(&self, record: ApiKeyRecord) {
        let mut keys = self.keys.write().unwrap_or_else(|e| e.into_inner());
        keys.insert(record.key_hash.clone(), record);
    }

    pub fn len(&self) -> usize {
        self.keys.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Validate an API key and return auth context
    pub fn validate(&self, key: &str) -> Result<AuthContext, AuthError> {
        if !key.starts_with(API_KEY_PREFIX) {
            return Err(AuthError::InvalidApiKey);
        }

        let key_hash = Self::hash_key(key);
        let keys = self.keys.read().unwrap_or_else(|e| e.into_inner());
        let record = keys.get(&key_hash).ok_or(AuthError::InvalidApiKey)?;

        if !record.active {
            return Err(AuthError::InvalidApiKey);
        }

        Ok(AuthContext::new(record.user_id))
    }

    /// Revoke an API key
    pub fn revoke(&self, key_hash: &str) {
        let mut keys = self.keys.write().unwrap_or_else(|e| e.into_inner());
        if let Some(record) = keys.get_mut(key_hash) {
            record.active = false;
        }
    }
}

impl Default for ApiKeyValidator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_key() {
        let (key, hash) = ApiKeyValidator::generate_key();

        assert!(key.starts_with(API_KEY_PREFIX));
        assert_eq!(hash.len(), 64);
    }

    #[test]
    fn test_validate_key() {
        let validator = ApiKeyValidator::new();
        let user = UserId::new();
        let (key, hash) = ApiKeyValidator::generate_key();

        validator.register_key(ApiKeyRecord {
            key_hash: hash,
            user_id: user,
            active: true,
        });

        let context = validator.validate(&key).unwrap();
        assert_eq!(context.user_id, user);
    }

    #[test]
    fn test_invalid_key() {
        let validator = ApiKeyValidator::new();
        assert!(validator.validate("invalid_key").is_err());
        assert!(validator.validate("vn_unknown").is_err());
    }

    #[test]
    fn test_revoked_key() {
        let validator = ApiKeyValidator::new();
        let (key, hash) = ApiKeyValidator::generate_key();

        validator.register_key(ApiKeyRecord {
            key_hash: hash.clone(),
            user_id: UserId::new(),
            active: true,
        });
        assert!(validator.validate(&key).is_ok());

        validator.revoke(&hash);
        assert!(validator.validate(&key).is_err());
    }

    #[test]
    fn test_parse_key_list() {
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let entries = format!("vn_alice:{alice}, vn_bob:{bob}");

        let validator = ApiKeyValidator::parse(&entries).unwrap();
        assert_eq!(validator.len(), 2);
        assert_eq!(validator.validate("vn_bob").unwrap().user_id.0, bob);

        assert!(ApiKeyValidator::parse("vn_x").is_err());
        assert!(ApiKeyValidator::parse("key:not-a-uuid").is_err());
        assert!(ApiKeyValidator::parse("").unwrap().is_empty());
    }
}
