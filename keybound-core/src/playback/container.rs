//! Encrypted media container, version 1.
//!
//! ```text
//! header  := "KBMC" | version u8 | algorithm u8 | chunk_size u32 LE | nonce_prefix
//! record  := len u32 LE | ciphertext || tag
//! file    := header record+
//! ```
//!
//! `nonce_prefix` is random, 7 bytes for the GCM ciphers and 19 bytes for
//! XChaCha20-Poly1305. Record `i` is sealed with the nonce
//! `nonce_prefix || i as u32 BE || last` where `last` is 1 on the final record
//! and 0 otherwise, and with the encoded header as associated data. Every
//! record but the last carries exactly `chunk_size` plaintext bytes.
//!
//! This binds each record to its position and to the stream it belongs to,
//! so reordering, splicing and truncation at a record boundary all fail
//! authentication.

use std::io::{self, Read, Write};

use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes128Gcm, Aes256Gcm};
use chacha20poly1305::XChaCha20Poly1305;
use rand::{rngs::OsRng, RngCore};
use secrecy::ExposeSecret;
use zeroize::Zeroizing;

use crate::content_key::{ContentAlgorithm, RawContentKey};
use crate::error::{KeyboundError, KeyboundResult};

/// Leading bytes of every container.
pub const CONTAINER_MAGIC: [u8; 4] = *b"KBMC";

/// Container format version written by this crate.
pub const CONTAINER_VERSION: u8 = 1;

/// Plaintext bytes per record unless specified otherwise.
pub const DEFAULT_CHUNK_SIZE: u32 = 64 * 1024;

/// Largest accepted `chunk_size`. Bounds the memory a reader allocates.
pub const MAX_CHUNK_SIZE: u32 = 8 * 1024 * 1024;

/// Counter and last-flag bytes appended to the nonce prefix.
const NONCE_SUFFIX_LEN: usize = 5;

/// Parsed container header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerHeader {
    algorithm: ContentAlgorithm,
    chunk_size: u32,
    nonce_prefix: Vec<u8>,
}

impl ContainerHeader {
    fn generate(algorithm: ContentAlgorithm, chunk_size: u32) -> KeyboundResult<Self> {
        if chunk_size == 0 || chunk_size > MAX_CHUNK_SIZE {
            return Err(KeyboundError::InvalidInput(format!(
                "chunk size must be between 1 and {MAX_CHUNK_SIZE}, got {chunk_size}"
            )));
        }
        let mut nonce_prefix = vec![0u8; prefix_len(algorithm)];
        OsRng.fill_bytes(&mut nonce_prefix);
        Ok(Self {
            algorithm,
            chunk_size,
            nonce_prefix,
        })
    }

    /// Cipher the content is sealed with.
    #[must_use]
    pub const fn algorithm(&self) -> ContentAlgorithm {
        self.algorithm
    }

    /// Plaintext bytes per full record.
    #[must_use]
    pub const fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    /// Size of the encoded header.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        CONTAINER_MAGIC.len() + 2 + 4 + self.nonce_prefix.len()
    }

    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        out.extend_from_slice(&CONTAINER_MAGIC);
        out.push(CONTAINER_VERSION);
        out.push(self.algorithm.id());
        out.extend_from_slice(&self.chunk_size.to_le_bytes());
        out.extend_from_slice(&self.nonce_prefix);
        out
    }

    fn read_from<R: Read>(reader: &mut R) -> KeyboundResult<Self> {
        let mut fixed = [0u8; 10];
        reader.read_exact(&mut fixed).map_err(truncated)?;
        if fixed[..4] != CONTAINER_MAGIC {
            return Err(KeyboundError::InvalidInput(
                "not a keybound media container".to_string(),
            ));
        }
        if fixed[4] != CONTAINER_VERSION {
            return Err(KeyboundError::InvalidInput(format!(
                "unsupported container version {}",
                fixed[4]
            )));
        }
        let algorithm = ContentAlgorithm::from_id(fixed[5]).ok_or_else(|| {
            KeyboundError::InvalidInput(format!("unknown content algorithm id {}", fixed[5]))
        })?;
        let chunk_size = u32::from_le_bytes([fixed[6], fixed[7], fixed[8], fixed[9]]);
        if chunk_size == 0 || chunk_size > MAX_CHUNK_SIZE {
            return Err(KeyboundError::InvalidInput(format!(
                "invalid chunk size {chunk_size}"
            )));
        }
        let mut nonce_prefix = vec![0u8; prefix_len(algorithm)];
        reader.read_exact(&mut nonce_prefix).map_err(truncated)?;
        Ok(Self {
            algorithm,
            chunk_size,
            nonce_prefix,
        })
    }

    fn nonce(&self, index: u32, last: bool) -> Vec<u8> {
        let mut nonce = Vec::with_capacity(self.algorithm.nonce_len());
        nonce.extend_from_slice(&self.nonce_prefix);
        nonce.extend_from_slice(&index.to_be_bytes());
        nonce.push(u8::from(last));
        nonce
    }

    fn max_record_len(&self) -> usize {
        self.chunk_size as usize + self.algorithm.tag_len()
    }
}

const fn prefix_len(algorithm: ContentAlgorithm) -> usize {
    algorithm.nonce_len() - NONCE_SUFFIX_LEN
}

fn truncated(err: io::Error) -> KeyboundError {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        KeyboundError::ContentIntegrity("container is truncated".to_string())
    } else {
        KeyboundError::Storage(format!("failed to read container: {err}"))
    }
}

enum ChunkCipher {
    Aes128(Box<Aes128Gcm>),
    Aes256(Box<Aes256Gcm>),
    XChaCha(Box<XChaCha20Poly1305>),
}

impl ChunkCipher {
    fn new(key: &RawContentKey) -> KeyboundResult<Self> {
        let bytes = key.expose_secret();
        let malformed = |_| KeyboundError::MalformedKey {
            expected: key.algorithm().key_len() as u64,
            actual: bytes.len() as u64,
        };
        Ok(match key.algorithm() {
            ContentAlgorithm::Aes128Gcm => {
                Self::Aes128(Box::new(Aes128Gcm::new_from_slice(bytes).map_err(malformed)?))
            }
            ContentAlgorithm::Aes256Gcm => {
                Self::Aes256(Box::new(Aes256Gcm::new_from_slice(bytes).map_err(malformed)?))
            }
            ContentAlgorithm::XChaCha20Poly1305 => Self::XChaCha(Box::new(
                XChaCha20Poly1305::new_from_slice(bytes).map_err(malformed)?,
            )),
        })
    }

    fn seal(&self, nonce: &[u8], aad: &[u8], msg: &[u8]) -> aes_gcm::aead::Result<Vec<u8>> {
        let payload = Payload { msg, aad };
        match self {
            Self::Aes128(cipher) => cipher.encrypt(GenericArray::from_slice(nonce), payload),
            Self::Aes256(cipher) => cipher.encrypt(GenericArray::from_slice(nonce), payload),
            Self::XChaCha(cipher) => cipher.encrypt(GenericArray::from_slice(nonce), payload),
        }
    }

    fn open(&self, nonce: &[u8], aad: &[u8], msg: &[u8]) -> aes_gcm::aead::Result<Vec<u8>> {
        let payload = Payload { msg, aad };
        match self {
            Self::Aes128(cipher) => cipher.decrypt(GenericArray::from_slice(nonce), payload),
            Self::Aes256(cipher) => cipher.decrypt(GenericArray::from_slice(nonce), payload),
            Self::XChaCha(cipher) => cipher.decrypt(GenericArray::from_slice(nonce), payload),
        }
    }
}

fn check_algorithm(key: &RawContentKey, header: &ContainerHeader) -> KeyboundResult<()> {
    if key.algorithm() == header.algorithm {
        Ok(())
    } else {
        Err(KeyboundError::InvalidInput(format!(
            "content key is for {:?} but the container uses {:?}",
            key.algorithm(),
            header.algorithm
        )))
    }
}

/// Packages plaintext into a container.
///
/// Plaintext is buffered until a full chunk is available. Call
/// [`ContainerWriter::finish`] to seal the final record; a writer dropped
/// without finishing leaves a container that fails authentication.
pub struct ContainerWriter<W: Write> {
    inner: W,
    cipher: ChunkCipher,
    header: ContainerHeader,
    aad: Vec<u8>,
    index: u32,
    pending: Zeroizing<Vec<u8>>,
}

impl<W: Write> ContainerWriter<W> {
    /// Writes the header to `inner` and returns a writer sealing under `key`.
    ///
    /// # Errors
    ///
    /// [`KeyboundError::InvalidInput`] for an out-of-range `chunk_size`,
    /// [`KeyboundError::Storage`] if the header cannot be written.
    pub fn new(mut inner: W, key: &RawContentKey, chunk_size: u32) -> KeyboundResult<Self> {
        let header = ContainerHeader::generate(key.algorithm(), chunk_size)?;
        let aad = header.encode();
        inner.write_all(&aad).map_err(write_failed)?;
        Ok(Self {
            inner,
            cipher: ChunkCipher::new(key)?,
            header,
            aad,
            index: 0,
            pending: Zeroizing::new(Vec::with_capacity(chunk_size as usize)),
        })
    }

    /// Header of the container being written.
    #[must_use]
    pub const fn header(&self) -> &ContainerHeader {
        &self.header
    }

    /// Seals the buffered remainder as the final record and returns the
    /// underlying writer.
    ///
    /// # Errors
    ///
    /// [`KeyboundError::Storage`] if writing fails.
    pub fn finish(mut self) -> KeyboundResult<W> {
        let last = Zeroizing::new(std::mem::take(&mut *self.pending));
        self.seal_record(&last, true).map_err(write_failed)?;
        self.inner.flush().map_err(write_failed)?;
        Ok(self.inner)
    }

    fn seal_record(&mut self, plaintext: &[u8], last: bool) -> io::Result<()> {
        let nonce = self.header.nonce(self.index, last);
        let sealed = self
            .cipher
            .seal(&nonce, &self.aad, plaintext)
            .map_err(|_| io::Error::other("chunk encryption failed"))?;
        let len = u32::try_from(sealed.len())
            .map_err(|_| io::Error::other("record exceeds u32 length"))?;
        self.inner.write_all(&len.to_le_bytes())?;
        self.inner.write_all(&sealed)?;
        self.index = self
            .index
            .checked_add(1)
            .ok_or_else(|| io::Error::other("container exceeds the record limit"))?;
        Ok(())
    }
}

impl<W: Write> Write for ContainerWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.pending.extend_from_slice(buf);
        let chunk_size = self.header.chunk_size as usize;
        // Keep at least one byte back so the final record is never empty
        // unless the whole stream is.
        while self.pending.len() > chunk_size {
            let rest = self.pending.split_off(chunk_size);
            let chunk = Zeroizing::new(std::mem::replace(&mut *self.pending, rest));
            self.seal_record(&chunk, false)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

fn write_failed(err: io::Error) -> KeyboundError {
    KeyboundError::Storage(format!("failed to write container: {err}"))
}

/// One record read from a container, still sealed.
#[derive(Debug)]
pub struct SealedChunk {
    index: u32,
    last: bool,
    ciphertext: Vec<u8>,
}

impl SealedChunk {
    /// Position of the record in the stream.
    #[must_use]
    pub const fn index(&self) -> u32 {
        self.index
    }

    /// Whether this is the final record.
    #[must_use]
    pub const fn is_last(&self) -> bool {
        self.last
    }
}

/// Reads records incrementally from a container.
///
/// Records are returned sealed; [`ContainerReader::open_chunk`] authenticates
/// and decrypts one. A record's last flag is known only once the reader has
/// looked for the next length prefix, so one prefix is always read ahead.
pub struct ContainerReader<R: Read> {
    inner: R,
    header: ContainerHeader,
    aad: Vec<u8>,
    index: u32,
    next_len: Option<usize>,
}

impl<R: Read> ContainerReader<R> {
    /// Parses the header and the first record length.
    ///
    /// # Errors
    ///
    /// [`KeyboundError::InvalidInput`] for a foreign or unsupported file,
    /// [`KeyboundError::ContentIntegrity`] if it ends early.
    pub fn new(mut inner: R) -> KeyboundResult<Self> {
        let header = ContainerHeader::read_from(&mut inner)?;
        let aad = header.encode();
        let mut reader = Self {
            inner,
            header,
            aad,
            index: 0,
            next_len: None,
        };
        reader.next_len = reader.read_len()?;
        if reader.next_len.is_none() {
            return Err(KeyboundError::ContentIntegrity(
                "container has no records".to_string(),
            ));
        }
        Ok(reader)
    }

    /// The container header.
    #[must_use]
    pub const fn header(&self) -> &ContainerHeader {
        &self.header
    }

    /// Next sealed record, or `None` after the last one.
    ///
    /// # Errors
    ///
    /// [`KeyboundError::ContentIntegrity`] for a truncated or oversized
    /// record.
    pub fn next_sealed(&mut self) -> KeyboundResult<Option<SealedChunk>> {
        let Some(len) = self.next_len.take() else {
            return Ok(None);
        };
        let mut ciphertext = vec![0u8; len];
        self.inner.read_exact(&mut ciphertext).map_err(truncated)?;
        self.next_len = self.read_len()?;

        let chunk = SealedChunk {
            index: self.index,
            last: self.next_len.is_none(),
            ciphertext,
        };
        if !chunk.last {
            self.index = self.index.checked_add(1).ok_or_else(|| {
                KeyboundError::ContentIntegrity("container exceeds the record limit".to_string())
            })?;
        }
        Ok(Some(chunk))
    }

    /// Authenticates and decrypts `chunk` with `key`.
    ///
    /// # Errors
    ///
    /// [`KeyboundError::ContentIntegrity`] if authentication fails,
    /// [`KeyboundError::InvalidInput`] if `key` is for another cipher.
    pub fn open_chunk(
        &self,
        key: &RawContentKey,
        chunk: &SealedChunk,
    ) -> KeyboundResult<Zeroizing<Vec<u8>>> {
        check_algorithm(key, &self.header)?;
        let cipher = ChunkCipher::new(key)?;
        let nonce = self.header.nonce(chunk.index, chunk.last);
        let plaintext = cipher
            .open(&nonce, &self.aad, &chunk.ciphertext)
            .map_err(|_| {
                KeyboundError::ContentIntegrity(format!(
                    "record {} failed authentication",
                    chunk.index
                ))
            })?;
        if !chunk.last && plaintext.len() != self.header.chunk_size as usize {
            return Err(KeyboundError::ContentIntegrity(format!(
                "record {} has the wrong length",
                chunk.index
            )));
        }
        Ok(Zeroizing::new(plaintext))
    }

    fn read_len(&mut self) -> KeyboundResult<Option<usize>> {
        let mut prefix = [0u8; 4];
        let mut filled = 0;
        while filled < prefix.len() {
            match self.inner.read(&mut prefix[filled..]) {
                Ok(0) if filled == 0 => return Ok(None),
                Ok(0) => {
                    return Err(KeyboundError::ContentIntegrity(
                        "container is truncated".to_string(),
                    ))
                }
                Ok(read) => filled += read,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(truncated(err)),
            }
        }
        let len = u32::from_le_bytes(prefix) as usize;
        if len < self.header.algorithm.tag_len() || len > self.header.max_record_len() {
            return Err(KeyboundError::ContentIntegrity(format!(
                "record length {len} out of range"
            )));
        }
        Ok(Some(len))
    }
}

/// Seals `plaintext` into an in-memory container.
///
/// # Errors
///
/// [`KeyboundError::InvalidInput`] for an out-of-range `chunk_size`.
pub fn seal_content(
    key: &RawContentKey,
    plaintext: &[u8],
    chunk_size: u32,
) -> KeyboundResult<Vec<u8>> {
    let mut writer = ContainerWriter::new(Vec::new(), key, chunk_size)?;
    writer.write_all(plaintext).map_err(write_failed)?;
    writer.finish()
}

/// Opens a whole in-memory container.
///
/// # Errors
///
/// As [`ContainerReader::new`] and [`ContainerReader::open_chunk`].
pub fn open_content(key: &RawContentKey, container: &[u8]) -> KeyboundResult<Zeroizing<Vec<u8>>> {
    let mut reader = ContainerReader::new(container)?;
    let mut plaintext = Zeroizing::new(Vec::new());
    while let Some(chunk) = reader.next_sealed()? {
        plaintext.extend_from_slice(&reader.open_chunk(key, &chunk)?);
    }
    Ok(plaintext)
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test_case(ContentAlgorithm::Aes128Gcm ; "aes128")]
    #[test_case(ContentAlgorithm::Aes256Gcm ; "aes256")]
    #[test_case(ContentAlgorithm::XChaCha20Poly1305 ; "xchacha")]
    fn test_seal_and_open(algorithm: ContentAlgorithm) {
        let key = RawContentKey::generate(algorithm);
        let plaintext = sample(10_000);
        let container = seal_content(&key, &plaintext, 1024).unwrap();

        let reader = ContainerReader::new(container.as_slice()).unwrap();
        assert_eq!(reader.header().algorithm(), algorithm);
        assert_eq!(reader.header().chunk_size(), 1024);
        assert_eq!(
            reader.header().encoded_len(),
            10 + algorithm.nonce_len() - NONCE_SUFFIX_LEN
        );

        assert_eq!(open_content(&key, &container).unwrap().as_slice(), plaintext);
    }

    #[test_case(0 ; "empty")]
    #[test_case(1 ; "one byte")]
    #[test_case(64 ; "exactly one chunk")]
    #[test_case(65 ; "one chunk plus one")]
    #[test_case(128 ; "exactly two chunks")]
    fn test_chunk_boundaries(len: usize) {
        let key = RawContentKey::generate(ContentAlgorithm::Aes256Gcm);
        let plaintext = sample(len);
        let container = seal_content(&key, &plaintext, 64).unwrap();

        let mut reader = ContainerReader::new(container.as_slice()).unwrap();
        let mut records = 0;
        let mut last_seen = false;
        while let Some(chunk) = reader.next_sealed().unwrap() {
            assert!(!last_seen);
            last_seen = chunk.is_last();
            records += 1;
        }
        assert!(last_seen);
        assert_eq!(records, len.div_ceil(64).max(1));
        assert_eq!(open_content(&key, &container).unwrap().as_slice(), plaintext);
    }

    #[test]
    fn test_writer_accepts_incremental_writes() {
        let key = RawContentKey::generate(ContentAlgorithm::XChaCha20Poly1305);
        let plaintext = sample(1000);
        let mut writer = ContainerWriter::new(Vec::new(), &key, 100).unwrap();
        for piece in plaintext.chunks(7) {
            writer.write_all(piece).unwrap();
        }
        let container = writer.finish().unwrap();
        assert_eq!(open_content(&key, &container).unwrap().as_slice(), plaintext);
    }

    #[test]
    fn test_every_byte_flip_is_detected() {
        let key = RawContentKey::generate(ContentAlgorithm::Aes128Gcm);
        let container = seal_content(&key, &sample(100), 32).unwrap();
        for position in 0..container.len() {
            let mut tampered = container.clone();
            tampered[position] ^= 0x01;
            assert!(
                open_content(&key, &tampered).is_err(),
                "flip at {position} went undetected"
            );
        }
    }

    #[test]
    fn test_truncation_at_record_boundary_is_detected() {
        let key = RawContentKey::generate(ContentAlgorithm::Aes256Gcm);
        let container = seal_content(&key, &sample(100), 50).unwrap();
        // header (17) + record (4 + 50 + 16)
        let first_record_end = 17 + 4 + 50 + 16;
        let truncated = &container[..first_record_end];
        assert!(matches!(
            open_content(&key, truncated),
            Err(KeyboundError::ContentIntegrity(_))
        ));
    }

    #[test]
    fn test_truncation_mid_record_is_detected() {
        let key = RawContentKey::generate(ContentAlgorithm::Aes256Gcm);
        let container = seal_content(&key, &sample(100), 50).unwrap();
        let truncated = &container[..container.len() - 3];
        assert!(matches!(
            open_content(&key, truncated),
            Err(KeyboundError::ContentIntegrity(_))
        ));
    }

    #[test]
    fn test_reordered_records_are_detected() {
        let key = RawContentKey::generate(ContentAlgorithm::Aes256Gcm);
        let container = seal_content(&key, &sample(150), 50).unwrap();
        let header = 17;
        let record = 4 + 50 + 16;
        let mut swapped = container[..header].to_vec();
        swapped.extend_from_slice(&container[header + record..header + 2 * record]);
        swapped.extend_from_slice(&container[header..header + record]);
        swapped.extend_from_slice(&container[header + 2 * record..]);
        assert!(matches!(
            open_content(&key, &swapped),
            Err(KeyboundError::ContentIntegrity(_))
        ));
    }

    #[test]
    fn test_wrong_key_fails_authentication() {
        let key = RawContentKey::generate(ContentAlgorithm::Aes256Gcm);
        let other = RawContentKey::generate(ContentAlgorithm::Aes256Gcm);
        let container = seal_content(&key, &sample(10), 64).unwrap();
        assert!(matches!(
            open_content(&other, &container),
            Err(KeyboundError::ContentIntegrity(_))
        ));
    }

    #[test]
    fn test_key_for_other_cipher_is_rejected() {
        let key = RawContentKey::generate(ContentAlgorithm::Aes256Gcm);
        let other = RawContentKey::generate(ContentAlgorithm::XChaCha20Poly1305);
        let container = seal_content(&key, &sample(10), 64).unwrap();
        assert!(matches!(
            open_content(&other, &container),
            Err(KeyboundError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_foreign_and_empty_input() {
        let key = RawContentKey::generate(ContentAlgorithm::Aes256Gcm);
        assert!(matches!(
            open_content(&key, b"RIFF\x01\x02\x00\x01\x00\x00"),
            Err(KeyboundError::InvalidInput(_))
        ));
        assert!(matches!(
            open_content(&key, b"KB"),
            Err(KeyboundError::ContentIntegrity(_))
        ));

        let container = seal_content(&key, b"x", 64).unwrap();
        assert!(matches!(
            open_content(&key, &container[..17]),
            Err(KeyboundError::ContentIntegrity(_))
        ));
    }

    #[test]
    fn test_chunk_size_is_validated() {
        let key = RawContentKey::generate(ContentAlgorithm::Aes256Gcm);
        assert!(seal_content(&key, b"x", 0).is_err());
        assert!(seal_content(&key, b"x", MAX_CHUNK_SIZE + 1).is_err());
    }
}
