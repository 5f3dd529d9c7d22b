//! Objects exported to Swift and Kotlin.
//!
//! The Rust API works with borrowed handles, zeroizing buffers and generic
//! readers; the types here wrap it in shapes `UniFFI` can carry across the
//! boundary.
//!
//! # Main Entry Points
//!
//! - [`DeviceKeys`] - the installation's identity key
//! - [`DeviceRegistration`] - registers that key with the backend
//! - [`ContentKeys`] - fetches wrapped content keys
//! - [`IntegrityMonitor`](crate::integrity::IntegrityMonitor) - trust verdicts and host signals
//! - [`ProtectedPlayer`] / [`ProtectedSession`] - integrity-gated decryption
//!
//! # Example (Swift)
//!
//! ```swift
//! let keys = DeviceKeys(keyStore: keychain, blobStore: files, policy: policy)
//! let registration = DeviceRegistration(
//!     keys: keys, environment: .production, baseUrl: nil,
//!     platform: .ios, attributes: attributes)
//! let identity = try await registration.ensureRegistered(deviceName: name, authToken: jwt)
//!
//! let grant = try await ContentKeys(environment: .production, baseUrl: nil)
//!     .fetch(contentId: 12, deviceId: identity.deviceId!, authToken: jwt)
//!
//! let monitor = IntegrityMonitor.withDefaultProbes(policy: .report)
//! let session = try ProtectedPlayer(keys: keys, monitor: monitor, observer: nil)
//!     .openFile(path: downloadPath)
//! try await session.loadKey(wrapped: grant.wrappedKey, handle: identity.handle)
//! try await session.play()
//! ```

mod device;
mod player;
mod types;

pub use device::{ContentKeys, DeviceKeys, DeviceRegistration};
pub use player::{ProtectedPlayer, ProtectedSession};
pub use types::{DeviceIdentityInfo, DeviceKeyHandle, MediaChunk};
