//! Media format registry
//!
//! Name-keyed catalog of codec descriptors. One registry is owned by each
//! manager rather than being process-global, so isolated managers (tests,
//! embedded stacks) do not share negotiation state.

use std::collections::BTreeMap;

use parking_lot::RwLock;
use tracing::debug;

use super::{names, FormatOption, MediaFormat, MediaType, MergePolicy, PayloadTypeSpec};
use super::{OPT_FRAME_TIME, OPT_MAX_BIT_RATE};
use crate::error::{Error, Result};

/// Name-keyed format catalog
pub struct FormatRegistry {
    formats: RwLock<BTreeMap<String, MediaFormat>>,
}

impl FormatRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self { formats: RwLock::new(BTreeMap::new()) }
    }

    /// Registry pre-seeded with the well-known telephony formats
    pub fn with_standard_formats() -> Self {
        let registry = Self::new();
        for format in standard_formats() {
            let _ = registry.register(format);
        }
        registry
    }

    /// Register a format.
    ///
    /// Fails when a distinct format already holds the name; re-registering
    /// an identical descriptor is a no-op.
    pub fn register(&self, format: MediaFormat) -> Result<()> {
        let mut formats = self.formats.write();
        if let Some(existing) = formats.get(format.name()) {
            if existing.payload_type() != format.payload_type()
                || existing.media_type() != format.media_type()
                || existing.clock_rate() != format.clock_rate()
            {
                return Err(Error::DuplicateFormat(format.name().to_string()));
            }
            return Ok(());
        }
        debug!("Registered media format {}", format.name());
        formats.insert(format.name().to_string(), format);
        Ok(())
    }

    /// Replace a registered format's descriptor, used after option
    /// negotiation settles new values
    pub fn set_registered(&self, format: MediaFormat) -> Result<()> {
        let mut formats = self.formats.write();
        if !formats.contains_key(format.name()) {
            return Err(Error::FormatNotFound(format.name().to_string()));
        }
        formats.insert(format.name().to_string(), format);
        Ok(())
    }

    /// Find by name
    pub fn find(&self, name: &str) -> Option<MediaFormat> {
        self.formats.read().get(name).cloned()
    }

    /// Find the format assigned a static payload type
    pub fn find_by_payload_type(&self, payload_type: u8) -> Option<MediaFormat> {
        self.formats
            .read()
            .values()
            .find(|f| matches!(f.payload_type(), PayloadTypeSpec::Static(pt) if pt == payload_type))
            .cloned()
    }

    /// All formats of the given media type, in name order
    pub fn by_media_type(&self, media_type: MediaType) -> Vec<MediaFormat> {
        self.formats
            .read()
            .values()
            .filter(|f| f.media_type() == media_type)
            .cloned()
            .collect()
    }

    /// Every registered format, in name order
    pub fn all(&self) -> Vec<MediaFormat> {
        self.formats.read().values().cloned().collect()
    }

    /// Number of registered formats
    pub fn len(&self) -> usize {
        self.formats.read().len()
    }
}

impl Default for FormatRegistry {
    fn default() -> Self {
        Self::with_standard_formats()
    }
}

fn audio(
    name: &str,
    payload_type: PayloadTypeSpec,
    frame_time: u32,
    bit_rate: i64,
) -> MediaFormat {
    MediaFormat::new(name, MediaType::Audio, payload_type, 8000, frame_time)
        .with_option(
            OPT_MAX_BIT_RATE,
            FormatOption::Int { value: bit_rate, min: 0, max: bit_rate },
            MergePolicy::Min,
        )
        .with_option(OPT_FRAME_TIME, FormatOption::int(frame_time as i64), MergePolicy::Max)
}

/// The well-known telephony formats
pub fn standard_formats() -> Vec<MediaFormat> {
    vec![
        audio(names::PCMU, PayloadTypeSpec::Static(0), 160, 64_000),
        audio(names::PCMA, PayloadTypeSpec::Static(8), 160, 64_000),
        audio(names::G722, PayloadTypeSpec::Static(9), 160, 64_000),
        audio(names::G729, PayloadTypeSpec::Static(18), 160, 8_000),
        audio(names::ILBC, PayloadTypeSpec::Dynamic, 240, 13_300),
        MediaFormat::new(
            names::TELEPHONE_EVENT,
            MediaType::Audio,
            PayloadTypeSpec::Dynamic,
            8000,
            0,
        ),
        // Internal raw format used between filters and local endpoints
        MediaFormat::new(names::PCM16, MediaType::Audio, PayloadTypeSpec::None, 8000, 160)
            .with_option(OPT_MAX_BIT_RATE, FormatOption::int(128_000), MergePolicy::Min),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_formats_present() {
        let registry = FormatRegistry::with_standard_formats();
        assert!(registry.find(names::PCMU).is_some());
        assert!(registry.find(names::PCMA).is_some());
        assert!(registry.find(names::TELEPHONE_EVENT).is_some());
        assert!(registry.find("nonexistent").is_none());
    }

    #[test]
    fn test_no_duplicate_names() {
        let registry = FormatRegistry::with_standard_formats();
        let conflicting =
            MediaFormat::new(names::PCMU, MediaType::Audio, PayloadTypeSpec::Static(5), 8000, 160);
        assert!(matches!(
            registry.register(conflicting),
            Err(Error::DuplicateFormat(_))
        ));

        // Identical re-registration is fine
        let same =
            MediaFormat::new(names::PCMU, MediaType::Audio, PayloadTypeSpec::Static(0), 8000, 160);
        assert!(registry.register(same).is_ok());
    }

    #[test]
    fn test_find_by_payload_type() {
        let registry = FormatRegistry::with_standard_formats();
        assert_eq!(registry.find_by_payload_type(0).unwrap().name(), names::PCMU);
        assert_eq!(registry.find_by_payload_type(8).unwrap().name(), names::PCMA);
        assert!(registry.find_by_payload_type(77).is_none());
    }

    #[test]
    fn test_set_registered_replaces_options() {
        let registry = FormatRegistry::with_standard_formats();
        let tweaked = registry
            .find(names::PCMU)
            .unwrap()
            .with_option_from_str(OPT_MAX_BIT_RATE, "32000")
            .unwrap();
        registry.set_registered(tweaked).unwrap();
        assert_eq!(registry.find(names::PCMU).unwrap().bandwidth(), 32000);

        let unknown = MediaFormat::new("Ghost", MediaType::Audio, PayloadTypeSpec::Dynamic, 8000, 160);
        assert!(matches!(
            registry.set_registered(unknown),
            Err(Error::FormatNotFound(_))
        ));
    }

    #[test]
    fn test_filter_by_media_type() {
        let registry = FormatRegistry::with_standard_formats();
        let audio = registry.by_media_type(MediaType::Audio);
        assert!(!audio.is_empty());
        assert!(audio.iter().all(|f| f.media_type() == MediaType::Audio));
        assert!(registry.by_media_type(MediaType::Video).is_empty());
    }
}
