//! Device fingerprint collection.
//!
//! A fingerprint is auxiliary registration metadata and anomaly-detection
//! input for the backend. It is not an identity: values may change across OS
//! upgrades or locale changes.

use std::collections::BTreeMap;

use serde::Serialize;
use sha2::{Digest, Sha256};

/// Attribute names collected, in query order.
pub const FINGERPRINT_ATTRIBUTES: [&str; 10] = [
    "platform",
    "os_family",
    "arch",
    "model",
    "os_version",
    "screen_resolution",
    "timezone",
    "language",
    "hardware_id",
    "cpu_count",
];

/// Attribute carrying the key store isolation level.
pub const KEY_STORAGE_ATTRIBUTE: &str = "key_storage";

/// A single fingerprint attribute value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum FingerprintValue {
    /// Free-form text.
    Text(String),
    /// Integer value.
    Number(i64),
}

impl From<&str> for FingerprintValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for FingerprintValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for FingerprintValue {
    fn from(value: i64) -> Self {
        Self::Number(value)
    }
}

/// Immutable, name-ordered set of device attributes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct DeviceFingerprint {
    attributes: BTreeMap<String, FingerprintValue>,
}

impl DeviceFingerprint {
    /// Value of the attribute `name`, if collected.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&FingerprintValue> {
        self.attributes.get(name)
    }

    /// Number of collected attributes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.attributes.len()
    }

    /// Whether nothing could be collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }

    /// Attributes in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &FingerprintValue)> {
        self.attributes
            .iter()
            .map(|(name, value)| (name.as_str(), value))
    }

    /// Returns a copy with `name` set to `value`.
    #[must_use]
    pub fn with_attribute(&self, name: &str, value: impl Into<FingerprintValue>) -> Self {
        let mut attributes = self.attributes.clone();
        attributes.insert(name.to_string(), value.into());
        Self { attributes }
    }

    /// Hex SHA-256 of the canonical (sorted-key JSON) encoding.
    #[must_use]
    pub fn digest(&self) -> String {
        let canonical = serde_json::to_vec(&self.attributes).unwrap_or_default();
        hex::encode(Sha256::digest(canonical))
    }
}

/// Supplies fingerprint attribute values.
///
/// Returning `None` omits the attribute; sources must not fail or block.
pub trait FingerprintSource: Send + Sync {
    /// Value of the attribute `name`, if this source knows it.
    fn attribute(&self, name: &str) -> Option<FingerprintValue>;
}

/// Attributes only the host application can see (device model, screen,
/// vendor id). Unset fields are omitted.
#[derive(Debug, Clone, Default, PartialEq, Eq, uniffi::Record)]
pub struct PlatformAttributes {
    /// Device model, e.g. `Pixel 8`.
    pub model: Option<String>,
    /// OS version string.
    pub os_version: Option<String>,
    /// Screen resolution as `WIDTHxHEIGHT`.
    pub screen_resolution: Option<String>,
    /// IANA timezone name.
    pub timezone: Option<String>,
    /// BCP-47 language tag.
    pub language: Option<String>,
    /// Platform vendor identifier (Android ID, `identifierForVendor`).
    pub hardware_id: Option<String>,
}

impl FingerprintSource for PlatformAttributes {
    fn attribute(&self, name: &str) -> Option<FingerprintValue> {
        let value = match name {
            "model" => self.model.as_ref(),
            "os_version" => self.os_version.as_ref(),
            "screen_resolution" => self.screen_resolution.as_ref(),
            "timezone" => self.timezone.as_ref(),
            "language" => self.language.as_ref(),
            "hardware_id" => self.hardware_id.as_ref(),
            _ => None,
        }?;
        Some(FingerprintValue::Text(value.clone()))
    }
}

/// Attributes visible to the Rust process itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostFingerprintSource;

impl FingerprintSource for HostFingerprintSource {
    fn attribute(&self, name: &str) -> Option<FingerprintValue> {
        match name {
            "platform" => Some(std::env::consts::OS.into()),
            "os_family" => Some(std::env::consts::FAMILY.into()),
            "arch" => Some(std::env::consts::ARCH.into()),
            "cpu_count" => std::thread::available_parallelism()
                .ok()
                .and_then(|count| i64::try_from(count.get()).ok())
                .map(FingerprintValue::Number),
            "timezone" => std::env::var("TZ").ok().map(Into::into),
            "language" => ["LC_ALL", "LANG"]
                .iter()
                .find_map(|var| std::env::var(var).ok())
                .and_then(|locale| normalize_locale(&locale))
                .map(Into::into),
            _ => None,
        }
    }
}

/// `en_US.UTF-8` → `en-US`. `C` and `POSIX` carry no information.
fn normalize_locale(locale: &str) -> Option<String> {
    let tag = locale.split(['.', '@']).next()?.replace('_', "-");
    if tag.is_empty() || tag == "C" || tag == "POSIX" {
        None
    } else {
        Some(tag)
    }
}

/// Builds a [`DeviceFingerprint`] from prioritized sources.
///
/// For each attribute the first source that knows it wins.
pub struct FingerprintCollector {
    sources: Vec<Box<dyn FingerprintSource>>,
}

impl FingerprintCollector {
    /// Collector over `sources`, highest priority first.
    #[must_use]
    pub fn new(sources: Vec<Box<dyn FingerprintSource>>) -> Self {
        Self { sources }
    }

    /// Host-application attributes first, then what the process can see.
    #[must_use]
    pub fn with_platform(attributes: PlatformAttributes) -> Self {
        Self::new(vec![Box::new(attributes), Box::new(HostFingerprintSource)])
    }

    /// Collects the fingerprint. Never fails; unknown or empty attributes
    /// are omitted.
    #[must_use]
    pub fn collect(&self) -> DeviceFingerprint {
        let attributes = FINGERPRINT_ATTRIBUTES
            .iter()
            .filter_map(|name| {
                self.sources
                    .iter()
                    .find_map(|source| source.attribute(name))
                    .filter(|value| {
                        !matches!(value, FingerprintValue::Text(text) if text.trim().is_empty())
                    })
                    .map(|value| ((*name).to_string(), value))
            })
            .collect();
        DeviceFingerprint { attributes }
    }
}

impl Default for FingerprintCollector {
    fn default() -> Self {
        Self::new(vec![Box::new(HostFingerprintSource)])
    }
}
