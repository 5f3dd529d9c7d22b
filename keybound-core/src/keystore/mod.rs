//! Identity key custody.
//!
//! The device identity is an RSA keypair created inside a
//! [`HardwareKeyStore`]. The private component is non-exportable; the
//! [`IdentityKeyManager`] only ever holds an alias and the public key, and
//! exposes decryption as an operation on a [`KeyHandle`].
//!
//! # Platform Implementations
//!
//! - iOS: Secure Enclave / Keychain, implemented in Swift
//! - Android: Android Keystore (`StrongBox` when available), implemented in Kotlin
//! - Everywhere else: [`SoftwareKeyStore`], which reports
//!   [`KeyStorageTier::Software`] so the weaker guarantee is visible to the
//!   backend's risk scoring.

mod identity;
mod manager;
mod software;
mod traits;

#[cfg(test)]
pub(crate) mod tests_utils;

pub use identity::{DeviceIdentity, KeyHandle};
pub use manager::{IdentityKeyManager, IDENTITY_KEY_ALIAS};
pub use software::SoftwareKeyStore;
pub use traits::{
    HardwareKeyStore, KeyAccessPolicy, KeyStorageTier, WrapAlgorithm, MIN_RSA_KEY_BITS,
};
