//! NTP timestamps as used by RTCP sender reports
//!
//! RFC 3550 carries wall-clock time as 64 bits: seconds since
//! 1 January 1900 plus a 2^-32 second fraction.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Seconds between the NTP epoch (1900) and the UNIX epoch (1970)
const NTP_UNIX_OFFSET: u64 = 2_208_988_800;

/// 64 bit NTP timestamp
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NtpTimestamp {
    /// Seconds since 1 January 1900
    pub seconds: u32,

    /// Fraction of a second in 2^-32 units
    pub fraction: u32,
}

impl NtpTimestamp {
    /// Timestamp for the current wall clock
    pub fn now() -> Self {
        let since_unix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO);
        Self::from_unix_duration(since_unix)
    }

    /// Build from a duration since the UNIX epoch
    pub fn from_unix_duration(duration: Duration) -> Self {
        let seconds = duration.as_secs() + NTP_UNIX_OFFSET;
        let fraction = ((duration.subsec_nanos() as u64) << 32) / 1_000_000_000;
        Self { seconds: seconds as u32, fraction: fraction as u32 }
    }

    /// Duration since the UNIX epoch; zero for pre-1970 values
    pub fn to_unix_duration(&self) -> Duration {
        let seconds = (self.seconds as u64).saturating_sub(NTP_UNIX_OFFSET);
        let nanos = ((self.fraction as u64) * 1_000_000_000) >> 32;
        Duration::new(seconds, nanos as u32)
    }

    /// Packed 64 bit form
    pub fn as_u64(&self) -> u64 {
        ((self.seconds as u64) << 32) | self.fraction as u64
    }

    /// Unpack the 64 bit form
    pub fn from_u64(value: u64) -> Self {
        Self { seconds: (value >> 32) as u32, fraction: value as u32 }
    }

    /// Middle 32 bits, used as the LSR field of reception reports
    pub fn middle_bits(&self) -> u32 {
        (self.seconds << 16) | (self.fraction >> 16)
    }
}
