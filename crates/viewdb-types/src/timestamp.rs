use std::fmt;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::TypeError;

/// Wall-clock instant with millisecond precision.
///
/// [`Timestamp::EPOCH`] doubles as the "no activity" sentinel: a
/// conversation without messages reports the epoch as its last activity.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp {
    millis: i64,
}

impl Timestamp {
    /// The UNIX epoch, `1970-01-01T00:00:00Z`.
    pub const EPOCH: Self = Self { millis: 0 };

    pub const fn from_millis(millis: i64) -> Self {
        Self { millis }
    }

    /// The current wall-clock time.
    pub fn now() -> Self {
        Self {
            millis: Utc::now().timestamp_millis(),
        }
    }

    pub const fn as_millis(&self) -> i64 {
        self.millis
    }

    pub const fn is_epoch(&self) -> bool {
        self.millis == 0
    }

    pub fn to_datetime(&self) -> Result<DateTime<Utc>, TypeError> {
        Utc.timestamp_millis_opt(self.millis)
            .single()
            .ok_or(TypeError::TimestampOutOfRange(self.millis))
    }
}

impl Default for Timestamp {
    fn default() -> Self {
        Self::EPOCH
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(dt: DateTime<Utc>) -> Self {
        Self {
            millis: dt.timestamp_millis(),
        }
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({}ms)", self.millis)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_datetime() {
            Ok(dt) => write!(f, "{}", dt.to_rfc3339()),
            Err(_) => write!(f, "{}ms", self.millis),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epoch_is_zero_and_default() {
        assert!(Timestamp::EPOCH.is_epoch());
        assert_eq!(Timestamp::default(), Timestamp::EPOCH);
        assert_eq!(Timestamp::EPOCH.as_millis(), 0);
    }

    #[test]
    fn ordering_follows_millis() {
        assert!(Timestamp::from_millis(10) < Timestamp::from_millis(20));
        assert!(Timestamp::EPOCH < Timestamp::from_millis(1));
    }

    #[test]
    fn now_is_after_2020() {
        // 2020-01-01T00:00:00Z
        assert!(Timestamp::now().as_millis() > 1_577_836_800_000);
    }

    #[test]
    fn datetime_conversion() {
        let ts = Timestamp::from_millis(1_000);
        let dt = ts.to_datetime().unwrap();
        assert_eq!(Timestamp::from(dt), ts);
    }

    #[test]
    fn display_is_rfc3339() {
        assert_eq!(Timestamp::EPOCH.to_string(), "1970-01-01T00:00:00+00:00");
    }

    #[test]
    fn serde_roundtrip() {
        let ts = Timestamp::from_millis(1_234_567);
        let json = serde_json::to_string(&ts).unwrap();
        let parsed: Timestamp = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, ts);
    }
}
