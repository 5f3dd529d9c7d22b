//! Integrity-gated decryption of protected media.
//!
//! A [`SecurePlaybackController`] opens a [`PlaybackSession`] per container.
//! The session holds at most one [`RawContentKey`](crate::RawContentKey) and
//! destroys it synchronously when the integrity verdict leaves
//! [`TrustLevel::Trusted`](crate::integrity::TrustLevel::Trusted): the halt
//! flag is raised first, then the key slot is cleared under its lock. A
//! chunk decrypted concurrently with the change is discarded, so no plaintext
//! is produced after the verdict changed.

pub mod container;
mod session;

pub use container::{
    open_content, seal_content, ContainerHeader, ContainerReader, ContainerWriter,
    DEFAULT_CHUNK_SIZE,
};
pub use session::{
    ChunkOutcome, PlaybackObserver, PlaybackSession, PlaybackState, SecurePlaybackController,
    StopReason,
};
