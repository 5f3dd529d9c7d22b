#![deny(clippy::all, clippy::pedantic, clippy::nursery)]
//! Device-bound content protection.
//!
//! Each installation holds one RSA identity key inside a platform key store.
//! The backend wraps per-content symmetric keys under that key; this crate
//! unwraps them only while the runtime environment is trusted, and destroys
//! them the moment it is not.
//!
//! ```text
//! FingerprintCollector ─┐
//! IdentityKeyManager ───┴─> DeviceRegistrar ──> backend (device id)
//! ContentKeyClient ──> WrappedContentKey ──> ContentKeyUnwrapper ──> RawContentKey
//! IntegrityMonitor ──(verdict)──> SecurePlaybackController ──> decrypted chunks
//! ```
//!
//! Platform capabilities (key store, blob storage, logging, user presence,
//! verdict and playback callbacks) are traits the host implements through
//! `UniFFI`; the objects the host calls into live in [`ffi`].

mod config;
pub use config::*;

mod content_key;
pub use content_key::*;

mod error;
pub use error::*;

pub mod ffi;

mod fingerprint;
pub use fingerprint::*;

pub mod integrity;

mod key_delivery;
pub use key_delivery::*;

pub mod keystore;

/// Bridges the `log` facade to a host-provided logger.
pub mod logger;

pub mod playback;

mod registration;
pub use registration::*;

mod storage;
pub use storage::*;

// private modules
mod http_request;

uniffi::setup_scaffolding!("keybound_core");
