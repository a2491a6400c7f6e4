//! Per-call string options
//!
//! A connection carries a key to string map that modifies its behaviour
//! for the one call. Keys the core understands are listed here; unknown
//! keys (including `<format>:<option>=<value>` codec overrides) pass
//! through to the media format adjustment stage.

use std::collections::BTreeMap;

use tandem_media_core::filters::SilenceDetectMode;
use tandem_media_core::format::MediaType;

/// Media types to start automatically, e.g. `audio:sendrecv\nvideo:no`
pub const OPT_AUTO_START: &str = "AutoStart";
/// User input transport: String, Tone, RFC2833, Q931 or InBand
pub const OPT_USER_INPUT_MODE: &str = "User-Input-Mode";
/// Minimum jitter delay, milliseconds
pub const OPT_MIN_JITTER: &str = "Min-Jitter";
/// Maximum jitter delay, milliseconds
pub const OPT_MAX_JITTER: &str = "Max-Jitter";
/// Disable the jitter buffer entirely
pub const OPT_DISABLE_JITTER: &str = "Disable-Jitter";
/// Record the call's audio; the value names the recording key
pub const OPT_RECORD_AUDIO: &str = "Record-Audio";
/// Distinctive ring / alerting type passed to the protocol
pub const OPT_ALERTING_TYPE: &str = "Alerting-Type";
/// Silence detection: none, fixed or adaptive
pub const OPT_SILENCE_DETECT_MODE: &str = "Silence-Detect-Mode";
/// Override the calling party name
pub const OPT_CALLING_PARTY_NAME: &str = "Calling-Party-Name";
/// Override the called party name
pub const OPT_CALLED_PARTY_NAME: &str = "Called-Party-Name";
/// Override the calling display name
pub const OPT_CALLING_DISPLAY_NAME: &str = "Calling-Display-Name";
/// Override the called display name
pub const OPT_CALLED_DISPLAY_NAME: &str = "Called-Display-Name";
/// Withhold caller identity from the remote
pub const OPT_PRESENTATION_BLOCK: &str = "Presentation-Blocked";
/// Comma separated format mask applied to this call only
pub const OPT_REMOVE_CODEC: &str = "Remove-Codec";
/// Multiplier applied to outgoing RFC 2833 durations
pub const OPT_DTMF_MULT: &str = "dtmf-mult";
/// Divisor applied to outgoing RFC 2833 durations
pub const OPT_DTMF_DIV: &str = "dtmf-div";

/// How user input digits travel to the far end
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub enum UserInputMode {
    /// Whole strings through the signalling channel
    String,
    /// RFC 2833 telephone events in the RTP stream
    #[default]
    Tone,
    /// Q.931 keypad information elements
    Q931,
    /// Audible tones mixed into the media at sample level
    InBand,
}

impl UserInputMode {
    /// Parse a configuration value; `Tone` and `RFC2833` are synonyms
    pub fn parse(text: &str) -> Option<Self> {
        match text.to_ascii_lowercase().as_str() {
            "string" => Some(UserInputMode::String),
            "tone" | "rfc2833" => Some(UserInputMode::Tone),
            "q931" | "q.931" => Some(UserInputMode::Q931),
            "inband" | "in-band" => Some(UserInputMode::InBand),
            _ => None,
        }
    }
}

/// Direction a media type is automatically started in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AutoStartDirection {
    /// Offer to send and receive
    #[default]
    SendReceive,
    /// Offer transmit only
    Transmit,
    /// Offer receive only
    Receive,
    /// Do not offer this media type
    DontOffer,
}

impl AutoStartDirection {
    fn parse(text: &str) -> Option<Self> {
        match text.to_ascii_lowercase().as_str() {
            "sendrecv" | "yes" | "true" => Some(AutoStartDirection::SendReceive),
            "sendonly" | "send" => Some(AutoStartDirection::Transmit),
            "recvonly" | "recv" => Some(AutoStartDirection::Receive),
            "no" | "false" | "dontoffer" => Some(AutoStartDirection::DontOffer),
            _ => None,
        }
    }

    /// This side offers transmission
    pub fn offers_transmit(self) -> bool {
        matches!(self, AutoStartDirection::SendReceive | AutoStartDirection::Transmit)
    }

    /// This side offers reception
    pub fn offers_receive(self) -> bool {
        matches!(self, AutoStartDirection::SendReceive | AutoStartDirection::Receive)
    }
}

/// Parsed `AutoStart` option: media type to direction
pub type AutoStartMap = BTreeMap<MediaType, AutoStartDirection>;

fn parse_media_type(text: &str) -> Option<MediaType> {
    match text.to_ascii_lowercase().as_str() {
        "audio" => Some(MediaType::Audio),
        "video" => Some(MediaType::Video),
        "data" => Some(MediaType::Data),
        _ => None,
    }
}

/// Parse the `AutoStart` value: newline or `;` separated
/// `mediatype:direction` entries
pub fn parse_auto_start(value: &str) -> AutoStartMap {
    let mut map = AutoStartMap::new();
    for entry in value.split(['\n', ';']) {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let Some((media, direction)) = entry.split_once(':') else { continue };
        if let (Some(media), Some(direction)) =
            (parse_media_type(media.trim()), AutoStartDirection::parse(direction.trim()))
        {
            map.insert(media, direction);
        }
    }
    map
}

/// Parse the silence detect option value
pub fn parse_silence_mode(value: &str) -> Option<SilenceDetectMode> {
    match value.to_ascii_lowercase().as_str() {
        "none" | "off" | "no" => Some(SilenceDetectMode::None),
        "adaptive" => Some(SilenceDetectMode::Adaptive),
        fixed => fixed.parse::<u32>().ok().map(SilenceDetectMode::Fixed),
    }
}

/// Key to string map attached to a connection for one call
#[derive(Debug, Clone, Default)]
pub struct StringOptions {
    values: BTreeMap<String, String>,
}

impl StringOptions {
    /// Empty option set
    pub fn new() -> Self {
        Self::default()
    }

    /// Set one option, replacing any previous value
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.values.insert(key.into(), value.into());
        self
    }

    /// Value for a key
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(|v| v.as_str())
    }

    /// Boolean interpretation of a key
    pub fn get_bool(&self, key: &str) -> bool {
        matches!(self.get(key), Some("1") | Some("true") | Some("yes") | Some("on"))
    }

    /// Numeric interpretation of a key
    pub fn get_u32(&self, key: &str) -> Option<u32> {
        self.get(key)?.parse().ok()
    }

    /// Merge `other` over this set; its values win on conflicts
    pub fn merge(&mut self, other: &StringOptions) {
        for (key, value) in &other.values {
            self.values.insert(key.clone(), value.clone());
        }
    }

    /// Iterate all options
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Codec overrides of the form `<format>:<option>=<value>`, returned
    /// as (format, option, value) triples
    pub fn codec_overrides(&self) -> Vec<(String, String, String)> {
        self.values
            .iter()
            .filter_map(|(key, value)| {
                let (format, option) = key.split_once(':')?;
                // Skip the keys the core owns itself
                if format.is_empty() || option.is_empty() {
                    return None;
                }
                Some((format.to_string(), option.to_string(), value.clone()))
            })
            .collect()
    }

    /// Number of options set
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// True when no options are set
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_input_mode_parsing() {
        assert_eq!(UserInputMode::parse("RFC2833"), Some(UserInputMode::Tone));
        assert_eq!(UserInputMode::parse("tone"), Some(UserInputMode::Tone));
        assert_eq!(UserInputMode::parse("Q.931"), Some(UserInputMode::Q931));
        assert_eq!(UserInputMode::parse("inband"), Some(UserInputMode::InBand));
        assert_eq!(UserInputMode::parse("string"), Some(UserInputMode::String));
        assert_eq!(UserInputMode::parse("smoke-signals"), None);
    }

    #[test]
    fn test_auto_start_parsing() {
        let map = parse_auto_start("audio:sendrecv\nvideo:no");
        assert_eq!(map.get(&MediaType::Audio), Some(&AutoStartDirection::SendReceive));
        assert_eq!(map.get(&MediaType::Video), Some(&AutoStartDirection::DontOffer));

        let map = parse_auto_start("audio:sendonly;video:recvonly");
        assert!(map[&MediaType::Audio].offers_transmit());
        assert!(!map[&MediaType::Audio].offers_receive());
        assert!(map[&MediaType::Video].offers_receive());
    }

    #[test]
    fn test_silence_mode_parsing() {
        assert_eq!(parse_silence_mode("none"), Some(SilenceDetectMode::None));
        assert_eq!(parse_silence_mode("adaptive"), Some(SilenceDetectMode::Adaptive));
        assert_eq!(parse_silence_mode("300"), Some(SilenceDetectMode::Fixed(300)));
        assert_eq!(parse_silence_mode("weird"), None);
    }

    #[test]
    fn test_options_merge_and_lookup() {
        let mut base = StringOptions::new();
        base.set(OPT_MIN_JITTER, "20").set(OPT_MAX_JITTER, "200");

        let mut overlay = StringOptions::new();
        overlay.set(OPT_MAX_JITTER, "500").set(OPT_DISABLE_JITTER, "yes");

        base.merge(&overlay);
        assert_eq!(base.get_u32(OPT_MIN_JITTER), Some(20));
        assert_eq!(base.get_u32(OPT_MAX_JITTER), Some(500));
        assert!(base.get_bool(OPT_DISABLE_JITTER));
    }

    #[test]
    fn test_codec_overrides() {
        let mut options = StringOptions::new();
        options.set("G.729:Annex B", "0");
        options.set(OPT_MIN_JITTER, "20");

        let overrides = options.codec_overrides();
        assert_eq!(overrides.len(), 1);
        assert_eq!(
            overrides[0],
            ("G.729".to_string(), "Annex B".to_string(), "0".to_string())
        );
    }
}
