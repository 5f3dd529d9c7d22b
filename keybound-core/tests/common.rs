//! Common test utilities shared across integration tests.

#![allow(dead_code, reason = "not every helper is used by every test binary")]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use keybound_core::keystore::{IdentityKeyManager, SoftwareKeyStore};
use keybound_core::{
    AtomicBlobStore, BackendConfig, DevicePlatform, DeviceRegistrar, DeviceType,
    FingerprintCollector, KeyboundError, PlatformAttributes, RegistrationClient,
};
use secrecy::SecretString;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

/// Installs a fmt subscriber once per test binary. Filter with `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Blob store over a directory, writing through a temporary file and a rename.
pub struct DiskBlobStore {
    root: PathBuf,
}

impl DiskBlobStore {
    pub fn new(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).expect("create blob root");
        Self { root }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }
}

fn storage_error(err: std::io::Error) -> KeyboundError {
    KeyboundError::Storage(err.to_string())
}

impl AtomicBlobStore for DiskBlobStore {
    fn read(&self, path: String) -> Result<Option<Vec<u8>>, KeyboundError> {
        match fs::read(self.path(&path)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(storage_error(err)),
        }
    }

    fn write_atomic(&self, path: String, bytes: Vec<u8>) -> Result<(), KeyboundError> {
        let target = self.path(&path);
        let tmp = target.with_extension("tmp");
        fs::write(&tmp, bytes).map_err(storage_error)?;
        fs::rename(&tmp, &target).map_err(storage_error)
    }

    fn delete(&self, path: String) -> Result<(), KeyboundError> {
        match fs::remove_file(self.path(&path)) {
            Err(err) if err.kind() != std::io::ErrorKind::NotFound => Err(storage_error(err)),
            _ => Ok(()),
        }
    }
}

pub fn temp_root() -> PathBuf {
    let mut path = std::env::temp_dir();
    path.push(format!("keybound-test-{}", Uuid::new_v4()));
    path
}

pub fn cleanup(root: &Path) {
    let _ = fs::remove_dir_all(root);
}

pub fn token() -> SecretString {
    SecretString::from("header.payload.signature".to_string())
}

/// One simulated installation: a key store that survives restarts and a
/// disk-backed record directory.
pub struct Device {
    pub key_store: Arc<SoftwareKeyStore>,
    pub blobs: Arc<DiskBlobStore>,
}

impl Device {
    pub fn new(root: &Path) -> Self {
        Self {
            key_store: Arc::new(SoftwareKeyStore::new()),
            blobs: Arc::new(DiskBlobStore::new(root)),
        }
    }

    /// A fresh manager over the same key store and records, as after an app
    /// restart.
    pub fn manager(&self) -> Arc<IdentityKeyManager> {
        Arc::new(IdentityKeyManager::new(
            self.key_store.clone(),
            self.blobs.clone(),
        ))
    }
}

pub fn registrar(manager: Arc<IdentityKeyManager>, base_url: &str) -> DeviceRegistrar {
    let client = RegistrationClient::new(BackendConfig::with_base_url(base_url))
        .with_device(DeviceType::Laptop, DevicePlatform::Linux);
    let collector = FingerprintCollector::with_platform(PlatformAttributes {
        model: Some("Integration Rig".to_string()),
        screen_resolution: Some("1920x1080".to_string()),
        ..PlatformAttributes::default()
    });
    DeviceRegistrar::new(manager, client, collector)
}
