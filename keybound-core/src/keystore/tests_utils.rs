//! Test helpers for the identity key store.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};

use super::software::SoftwareKeyStore;
use super::traits::{HardwareKeyStore, KeyAccessPolicy, KeyStorageTier, WrapAlgorithm};
use crate::error::KeyboundResult;

/// Key store call held by a [`GatedKeyStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatedCall {
    Generate,
    Decrypt,
}

/// Delegates to a [`SoftwareKeyStore`], parking the first `call` until the
/// test lets it through.
pub struct GatedKeyStore {
    pub inner: SoftwareKeyStore,
    call: GatedCall,
    armed: AtomicBool,
    entered: Barrier,
    release: Barrier,
}

impl GatedKeyStore {
    pub fn new(call: GatedCall) -> Arc<Self> {
        Arc::new(Self {
            inner: SoftwareKeyStore::new(),
            call,
            armed: AtomicBool::new(true),
            entered: Barrier::new(2),
            release: Barrier::new(2),
        })
    }

    /// Resolves once the gated call is parked inside the store.
    pub async fn wait_entered(self: &Arc<Self>) {
        let store = Arc::clone(self);
        tokio::task::spawn_blocking(move || {
            store.entered.wait();
        })
        .await
        .unwrap();
    }

    /// Lets the parked call continue.
    pub async fn release(self: &Arc<Self>) {
        let store = Arc::clone(self);
        tokio::task::spawn_blocking(move || {
            store.release.wait();
        })
        .await
        .unwrap();
    }

    fn pass(&self, call: GatedCall) {
        if call == self.call && self.armed.swap(false, Ordering::SeqCst) {
            self.entered.wait();
            self.release.wait();
        }
    }
}

impl HardwareKeyStore for GatedKeyStore {
    fn storage_tier(&self) -> KeyStorageTier {
        KeyStorageTier::Software
    }

    fn generate_keypair(&self, alias: String, policy: KeyAccessPolicy) -> KeyboundResult<Vec<u8>> {
        self.pass(GatedCall::Generate);
        self.inner.generate_keypair(alias, policy)
    }

    fn public_key(&self, alias: String) -> KeyboundResult<Option<Vec<u8>>> {
        self.inner.public_key(alias)
    }

    fn decrypt(
        &self,
        alias: String,
        algorithm: WrapAlgorithm,
        ciphertext: Vec<u8>,
    ) -> KeyboundResult<Vec<u8>> {
        self.pass(GatedCall::Decrypt);
        self.inner.decrypt(alias, algorithm, ciphertext)
    }

    fn delete(&self, alias: String) -> KeyboundResult<()> {
        self.inner.delete(alias)
    }
}
