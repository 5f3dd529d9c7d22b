//! Software key store fallback.
//!
//! Keys live in process memory. This provides no hardware isolation and
//! reports [`KeyStorageTier::Software`] so the backend can score the device
//! accordingly. Intended for desktop development, CI and tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use rand::rngs::OsRng;
use rsa::pkcs8::EncodePublicKey;
use rsa::{RsaPrivateKey, RsaPublicKey};

use super::traits::{
    HardwareKeyStore, KeyAccessPolicy, KeyStorageTier, WrapAlgorithm, MIN_RSA_KEY_BITS,
};
use crate::error::{KeyboundError, KeyboundResult};

struct SoftwareKey {
    private_key: Box<RsaPrivateKey>,
    public_key_der: Vec<u8>,
    require_user_presence: bool,
}

/// In-process RSA key store.
pub struct SoftwareKeyStore {
    keys: Mutex<HashMap<String, SoftwareKey>>,
    presence_confirmed: AtomicBool,
}

impl SoftwareKeyStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            keys: Mutex::new(HashMap::new()),
            presence_confirmed: AtomicBool::new(false),
        }
    }

    /// Records a successful user-presence check. Authorizes exactly one
    /// decryption with a presence-gated key.
    pub fn confirm_user_presence(&self) {
        self.presence_confirmed.store(true, Ordering::SeqCst);
    }

    /// Drops every key, as an OS-level key store reset would.
    pub fn clear(&self) {
        if let Ok(mut keys) = self.keys.lock() {
            keys.clear();
        }
    }

    /// Number of keys currently held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.lock().map_or(0, |keys| keys.len())
    }

    /// Whether the store holds no keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> KeyboundResult<std::sync::MutexGuard<'_, HashMap<String, SoftwareKey>>> {
        self.keys
            .lock()
            .map_err(|_| KeyboundError::InvalidState("software key store poisoned".to_string()))
    }
}

impl Default for SoftwareKeyStore {
    fn default() -> Self {
        Self::new()
    }
}

impl HardwareKeyStore for SoftwareKeyStore {
    fn storage_tier(&self) -> KeyStorageTier {
        KeyStorageTier::Software
    }

    fn generate_keypair(
        &self,
        alias: String,
        policy: KeyAccessPolicy,
    ) -> KeyboundResult<Vec<u8>> {
        if policy.key_size_bits < MIN_RSA_KEY_BITS {
            return Err(KeyboundError::KeyGeneration(format!(
                "key size {} below minimum {MIN_RSA_KEY_BITS}",
                policy.key_size_bits
            )));
        }

        let mut keys = self.lock()?;
        if let Some(existing) = keys.get(&alias) {
            return Ok(existing.public_key_der.clone());
        }

        let private_key = RsaPrivateKey::new(&mut OsRng, policy.key_size_bits as usize)
            .map_err(|err| KeyboundError::KeyGeneration(err.to_string()))?;
        let public_key_der = RsaPublicKey::from(&private_key)
            .to_public_key_der()
            .map_err(|err| KeyboundError::KeyGeneration(err.to_string()))?
            .as_bytes()
            .to_vec();

        keys.insert(
            alias,
            SoftwareKey {
                private_key: Box::new(private_key),
                public_key_der: public_key_der.clone(),
                require_user_presence: policy.require_user_presence,
            },
        );
        drop(keys);
        Ok(public_key_der)
    }

    fn public_key(&self, alias: String) -> KeyboundResult<Option<Vec<u8>>> {
        Ok(self
            .lock()?
            .get(&alias)
            .map(|key| key.public_key_der.clone()))
    }

    fn decrypt(
        &self,
        alias: String,
        algorithm: WrapAlgorithm,
        ciphertext: Vec<u8>,
    ) -> KeyboundResult<Vec<u8>> {
        let keys = self.lock()?;
        let key = keys
            .get(&alias)
            .ok_or_else(|| KeyboundError::key_not_found(alias.as_str()))?;

        if key.require_user_presence && !self.presence_confirmed.swap(false, Ordering::SeqCst) {
            return Err(KeyboundError::AuthenticationRequired);
        }

        key.private_key
            .decrypt(algorithm.padding(), &ciphertext)
            .map_err(|err| KeyboundError::Decryption(err.to_string()))
    }

    fn delete(&self, alias: String) -> KeyboundResult<()> {
        self.lock()?.remove(&alias);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use rsa::pkcs8::DecodePublicKey;

    use super::*;

    fn wrap(public_key_der: &[u8], algorithm: WrapAlgorithm, key: &[u8]) -> Vec<u8> {
        let public_key = RsaPublicKey::from_public_key_der(public_key_der).unwrap();
        public_key
            .encrypt(&mut OsRng, algorithm.padding(), key)
            .unwrap()
    }

    #[test]
    fn test_generate_is_idempotent_per_alias() {
        let store = SoftwareKeyStore::new();
        let first = store
            .generate_keypair("a".to_string(), KeyAccessPolicy::default())
            .unwrap();
        let second = store
            .generate_keypair("a".to_string(), KeyAccessPolicy::default())
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(store.len(), 1);
        assert!(first.len() >= 256);
    }

    #[test]
    fn test_rejects_weak_key_size() {
        let store = SoftwareKeyStore::new();
        let policy = KeyAccessPolicy {
            key_size_bits: 1024,
            require_user_presence: false,
        };
        assert!(matches!(
            store.generate_keypair("a".to_string(), policy),
            Err(KeyboundError::KeyGeneration(_))
        ));
        assert!(store.is_empty());
    }

    #[test]
    fn test_decrypt_with_each_padding() {
        let store = SoftwareKeyStore::new();
        let public_key = store
            .generate_keypair("a".to_string(), KeyAccessPolicy::default())
            .unwrap();
        for algorithm in [WrapAlgorithm::RsaOaepSha256, WrapAlgorithm::RsaOaepSha1] {
            let wrapped = wrap(&public_key, algorithm, &[7u8; 32]);
            let plain = store
                .decrypt("a".to_string(), algorithm, wrapped)
                .unwrap();
            assert_eq!(plain, vec![7u8; 32]);
        }
    }

    #[test]
    fn test_padding_mismatch_is_decryption_error() {
        let store = SoftwareKeyStore::new();
        let public_key = store
            .generate_keypair("a".to_string(), KeyAccessPolicy::default())
            .unwrap();
        let wrapped = wrap(&public_key, WrapAlgorithm::RsaOaepSha256, &[7u8; 32]);
        assert!(matches!(
            store.decrypt("a".to_string(), WrapAlgorithm::RsaOaepSha1, wrapped),
            Err(KeyboundError::Decryption(_))
        ));
    }

    #[test]
    fn test_user_presence_gate_consumes_confirmation() {
        let store = SoftwareKeyStore::new();
        let policy = KeyAccessPolicy {
            require_user_presence: true,
            ..KeyAccessPolicy::default()
        };
        let public_key = store.generate_keypair("a".to_string(), policy).unwrap();
        let wrapped = wrap(&public_key, WrapAlgorithm::RsaOaepSha256, &[1u8; 16]);

        assert!(matches!(
            store.decrypt("a".to_string(), WrapAlgorithm::RsaOaepSha256, wrapped.clone()),
            Err(KeyboundError::AuthenticationRequired)
        ));

        store.confirm_user_presence();
        assert!(store
            .decrypt("a".to_string(), WrapAlgorithm::RsaOaepSha256, wrapped.clone())
            .is_ok());

        assert!(matches!(
            store.decrypt("a".to_string(), WrapAlgorithm::RsaOaepSha256, wrapped),
            Err(KeyboundError::AuthenticationRequired)
        ));
    }

    #[test]
    fn test_clear_makes_keys_unavailable() {
        let store = SoftwareKeyStore::new();
        store
            .generate_keypair("a".to_string(), KeyAccessPolicy::default())
            .unwrap();
        store.clear();
        assert!(store.public_key("a".to_string()).unwrap().is_none());
        assert!(matches!(
            store.decrypt("a".to_string(), WrapAlgorithm::RsaOaepSha256, vec![0; 256]),
            Err(KeyboundError::KeyNotFound { .. })
        ));
    }
}
