//! Media format descriptors
//!
//! A `MediaFormat` is an immutable-by-reference descriptor of a codec:
//! name, media type, wire payload type, clock rate, frame time and a typed
//! option map. Formats are shared by `Arc`; "modifying" one builds a new
//! descriptor. Each option carries a merge policy applied when local and
//! remote advertisements are combined during negotiation.

pub mod list;
pub mod registry;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{Error, Result};

/// Option the bandwidth accounting reads, bits per second
pub const OPT_MAX_BIT_RATE: &str = "Max Bit Rate";

/// Option holding the receive frame size in clock units
pub const OPT_FRAME_TIME: &str = "Frame Time";

/// Kind of media a format carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub enum MediaType {
    /// Audio channels
    Audio,
    /// Video channels
    Video,
    /// Application data (T.38, messaging)
    Data,
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaType::Audio => f.write_str("audio"),
            MediaType::Video => f.write_str("video"),
            MediaType::Data => f.write_str("data"),
        }
    }
}

/// Wire payload type assignment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadTypeSpec {
    /// Fixed assignment from RFC 3551 (0..=95)
    Static(u8),
    /// Negotiated per call from the dynamic range (>= 96)
    Dynamic,
    /// Not carried on RTP at all (internal raw formats)
    None,
}

/// How an option combines with the remote side's value
#[derive(Clone, Copy)]
pub enum MergePolicy {
    /// Take the smaller value
    Min,
    /// Take the larger value
    Max,
    /// Values must already agree
    Equal,
    /// Keep the local value
    No,
    /// Take the remote value
    Always,
    /// Caller-supplied combination
    Custom(fn(&FormatOption, &FormatOption) -> FormatOption),
}

impl fmt::Debug for MergePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MergePolicy::Min => f.write_str("Min"),
            MergePolicy::Max => f.write_str("Max"),
            MergePolicy::Equal => f.write_str("Equal"),
            MergePolicy::No => f.write_str("No"),
            MergePolicy::Always => f.write_str("Always"),
            MergePolicy::Custom(_) => f.write_str("Custom"),
        }
    }
}

/// Typed option value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormatOption {
    /// Boolean flag
    Bool(bool),
    /// Bounded integer
    Int {
        /// Current value
        value: i64,
        /// Smallest permitted value
        min: i64,
        /// Largest permitted value
        max: i64,
    },
    /// One of a fixed set of names
    Enum {
        /// Index into `names`
        value: usize,
        /// Permitted names
        names: Vec<String>,
    },
    /// Free-form string
    String(String),
}

impl FormatOption {
    /// Unbounded integer helper
    pub fn int(value: i64) -> Self {
        FormatOption::Int { value, min: i64::MIN, max: i64::MAX }
    }

    /// Integer value when this option is numeric
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            FormatOption::Int { value, .. } => Some(*value),
            _ => None,
        }
    }

    /// Set from a configuration string, keeping the option's type
    pub fn set_from_str(&mut self, text: &str) -> bool {
        match self {
            FormatOption::Bool(value) => match text {
                "1" | "true" | "yes" | "on" => {
                    *value = true;
                    true
                }
                "0" | "false" | "no" | "off" => {
                    *value = false;
                    true
                }
                _ => false,
            },
            FormatOption::Int { value, min, max } => match text.parse::<i64>() {
                Ok(parsed) if parsed >= *min && parsed <= *max => {
                    *value = parsed;
                    true
                }
                _ => false,
            },
            FormatOption::Enum { value, names } => {
                match names.iter().position(|n| n.eq_ignore_ascii_case(text)) {
                    Some(index) => {
                        *value = index;
                        true
                    }
                    None => false,
                }
            }
            FormatOption::String(value) => {
                *value = text.to_string();
                true
            }
        }
    }
}

#[derive(Debug, Clone)]
struct OptionEntry {
    value: FormatOption,
    policy: MergePolicy,
}

#[derive(Debug, Clone)]
struct FormatInner {
    name: String,
    media_type: MediaType,
    payload_type: PayloadTypeSpec,
    clock_rate: u32,
    frame_time: u32,
    options: BTreeMap<String, OptionEntry>,
}

/// Immutable, reference-shared codec descriptor
#[derive(Clone)]
pub struct MediaFormat {
    inner: Arc<FormatInner>,
}

impl MediaFormat {
    /// Create a descriptor. `frame_time` is in clock units per packet.
    pub fn new(
        name: impl Into<String>,
        media_type: MediaType,
        payload_type: PayloadTypeSpec,
        clock_rate: u32,
        frame_time: u32,
    ) -> Self {
        Self {
            inner: Arc::new(FormatInner {
                name: name.into(),
                media_type,
                payload_type,
                clock_rate,
                frame_time,
                options: BTreeMap::new(),
            }),
        }
    }

    /// Format name, the registry key
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Media type
    pub fn media_type(&self) -> MediaType {
        self.inner.media_type
    }

    /// Payload type assignment
    pub fn payload_type(&self) -> PayloadTypeSpec {
        self.inner.payload_type
    }

    /// Media clock rate in Hz
    pub fn clock_rate(&self) -> u32 {
        self.inner.clock_rate
    }

    /// Clock units per packet
    pub fn frame_time(&self) -> u32 {
        self.inner.frame_time
    }

    /// True when this format can travel over RTP
    pub fn is_transportable(&self) -> bool {
        !matches!(self.inner.payload_type, PayloadTypeSpec::None)
    }

    /// Declared bandwidth usage in bits per second, for pre-admission
    /// accounting; zero when the option is absent
    pub fn bandwidth(&self) -> u64 {
        self.option(OPT_MAX_BIT_RATE).and_then(|o| o.as_i64()).unwrap_or(0).max(0) as u64
    }

    /// Builder-style: add an option with its merge policy
    pub fn with_option(
        self,
        name: impl Into<String>,
        value: FormatOption,
        policy: MergePolicy,
    ) -> Self {
        let mut inner = (*self.inner).clone();
        inner.options.insert(name.into(), OptionEntry { value, policy });
        Self { inner: Arc::new(inner) }
    }

    /// Look an option up
    pub fn option(&self, name: &str) -> Option<&FormatOption> {
        self.inner.options.get(name).map(|e| &e.value)
    }

    /// Option names in sorted order
    pub fn option_names(&self) -> Vec<&str> {
        self.inner.options.keys().map(|k| k.as_str()).collect()
    }

    /// New descriptor with one option changed from a configuration string.
    ///
    /// Returns `None` when the option does not exist or the text does not
    /// parse for its type.
    pub fn with_option_from_str(&self, name: &str, text: &str) -> Option<Self> {
        let mut inner = (*self.inner).clone();
        let entry = inner.options.get_mut(name)?;
        if !entry.value.set_from_str(text) {
            return None;
        }
        Some(Self { inner: Arc::new(inner) })
    }

    /// Merge the remote advertisement into this format, applying each
    /// option's policy. Options only one side knows are kept as-is.
    pub fn merge(&self, remote: &MediaFormat) -> Result<MediaFormat> {
        let mut inner = (*self.inner).clone();

        for (name, local_entry) in inner.options.iter_mut() {
            let Some(remote_value) = remote.option(name) else { continue };
            let merged = match local_entry.policy {
                MergePolicy::No => continue,
                MergePolicy::Always => remote_value.clone(),
                MergePolicy::Equal => {
                    if local_entry.value != *remote_value {
                        return Err(Error::MergeConflict(name.clone(), "values differ"));
                    }
                    continue;
                }
                MergePolicy::Min | MergePolicy::Max => {
                    match (&local_entry.value, remote_value) {
                        (
                            FormatOption::Int { value: a, min, max },
                            FormatOption::Int { value: b, .. },
                        ) => {
                            let picked = if matches!(local_entry.policy, MergePolicy::Min) {
                                (*a).min(*b)
                            } else {
                                (*a).max(*b)
                            };
                            FormatOption::Int { value: picked, min: *min, max: *max }
                        }
                        _ => return Err(Error::MergeConflict(name.clone(), "not numeric")),
                    }
                }
                MergePolicy::Custom(combine) => combine(&local_entry.value, remote_value),
            };
            local_entry.value = merged;
        }

        // Remote-only options ride along so later stages can see them
        for name in remote.option_names() {
            if !inner.options.contains_key(name) {
                inner.options.insert(
                    name.to_string(),
                    OptionEntry {
                        value: remote.option(name).unwrap().clone(),
                        policy: MergePolicy::No,
                    },
                );
            }
        }

        Ok(Self { inner: Arc::new(inner) })
    }
}

impl PartialEq for MediaFormat {
    fn eq(&self, other: &Self) -> bool {
        self.inner.name == other.inner.name
    }
}

impl Eq for MediaFormat {}

impl fmt::Debug for MediaFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MediaFormat({})", self.inner.name)
    }
}

impl fmt::Display for MediaFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.inner.name)
    }
}

/// Well-known format names used across the stack
pub mod names {
    /// G.711 mu-law
    pub const PCMU: &str = "G.711-uLaw-64k";
    /// G.711 A-law
    pub const PCMA: &str = "G.711-ALaw-64k";
    /// G.722 wideband
    pub const G722: &str = "G.722-64k";
    /// G.729 annex A/B
    pub const G729: &str = "G.729";
    /// iLBC 13.3 kbit mode
    pub const ILBC: &str = "iLBC-13k3";
    /// RFC 2833 telephone events
    pub const TELEPHONE_EVENT: &str = "UserInput/RFC2833";
    /// Internal 16 bit linear PCM
    pub const PCM16: &str = "PCM-16";
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pcmu() -> MediaFormat {
        MediaFormat::new(names::PCMU, MediaType::Audio, PayloadTypeSpec::Static(0), 8000, 160)
            .with_option(
                OPT_MAX_BIT_RATE,
                FormatOption::Int { value: 64000, min: 0, max: 64000 },
                MergePolicy::Min,
            )
    }

    #[test]
    fn test_accessors() {
        let format = pcmu();
        assert_eq!(format.name(), names::PCMU);
        assert_eq!(format.media_type(), MediaType::Audio);
        assert_eq!(format.clock_rate(), 8000);
        assert_eq!(format.bandwidth(), 64000);
        assert!(format.is_transportable());
    }

    #[test]
    fn test_equality_is_by_name() {
        let a = pcmu();
        let b = MediaFormat::new(names::PCMU, MediaType::Audio, PayloadTypeSpec::Static(0), 8000, 160);
        assert_eq!(a, b);
    }

    #[test]
    fn test_merge_min_policy() {
        let local = pcmu();
        let remote = MediaFormat::new(names::PCMU, MediaType::Audio, PayloadTypeSpec::Static(0), 8000, 160)
            .with_option(OPT_MAX_BIT_RATE, FormatOption::int(48000), MergePolicy::Min);
        let merged = local.merge(&remote).unwrap();
        assert_eq!(merged.option(OPT_MAX_BIT_RATE).unwrap().as_i64(), Some(48000));
    }

    #[test]
    fn test_merge_equal_policy_conflict() {
        let local = pcmu().with_option("Annex B", FormatOption::Bool(true), MergePolicy::Equal);
        let remote = pcmu().with_option("Annex B", FormatOption::Bool(false), MergePolicy::Equal);
        assert!(local.merge(&remote).is_err());
    }

    #[test]
    fn test_merge_always_takes_remote() {
        let local = pcmu().with_option("Mode", FormatOption::String("a".into()), MergePolicy::Always);
        let remote = pcmu().with_option("Mode", FormatOption::String("b".into()), MergePolicy::No);
        let merged = local.merge(&remote).unwrap();
        assert_eq!(merged.option("Mode"), Some(&FormatOption::String("b".into())));
    }

    #[test]
    fn test_merge_keeps_remote_only_options() {
        let local = pcmu();
        let remote = pcmu().with_option("Extra", FormatOption::int(1), MergePolicy::No);
        let merged = local.merge(&remote).unwrap();
        assert!(merged.option("Extra").is_some());
    }

    #[test]
    fn test_option_from_str_respects_bounds() {
        let format = pcmu();
        assert!(format.with_option_from_str(OPT_MAX_BIT_RATE, "32000").is_some());
        // Above the option's max
        assert!(format.with_option_from_str(OPT_MAX_BIT_RATE, "999999").is_none());
        // Unknown option
        assert!(format.with_option_from_str("Nope", "1").is_none());
    }

    #[test]
    fn test_option_set_from_str_types() {
        let mut flag = FormatOption::Bool(false);
        assert!(flag.set_from_str("yes"));
        assert_eq!(flag, FormatOption::Bool(true));

        let mut pick = FormatOption::Enum {
            value: 0,
            names: vec!["Off".to_string(), "Adaptive".to_string()],
        };
        assert!(pick.set_from_str("adaptive"));
        assert!(matches!(pick, FormatOption::Enum { value: 1, .. }));
        assert!(!pick.set_from_str("bogus"));
    }
}
