//! Time-ordered message identifiers
//!
//! Message ids are Discord-style snowflakes: the top 42 bits hold the
//! creation time in milliseconds since the platform epoch, the low 22 bits
//! disambiguate messages created in the same millisecond. Ordering ids is
//! therefore ordering messages by creation time.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Platform epoch (2015-01-01T00:00:00Z) in Unix milliseconds
pub const EPOCH_MS: i64 = 1_420_070_400_000;

const TIMESTAMP_SHIFT: u32 = 22;

/// A time-ordered message identifier
///
/// Serializes as a number; deserializes from a number or a decimal string,
/// since chat platform exports usually quote ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct Snowflake(pub u64);

impl Snowflake {
    /// Smallest id that sorts before every real message
    pub const MIN: Self = Self(0);

    /// Creation time encoded in the id
    #[must_use]
    pub fn timestamp(self) -> DateTime<Utc> {
        #[allow(clippy::cast_possible_wrap)]
        let ms = (self.0 >> TIMESTAMP_SHIFT) as i64 + EPOCH_MS;
        Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
    }

    /// Smallest id that could have been created at `at`
    ///
    /// Times before the epoch clamp to [`Snowflake::MIN`].
    #[must_use]
    pub fn from_datetime(at: DateTime<Utc>) -> Self {
        let ms = at.timestamp_millis() - EPOCH_MS;
        u64::try_from(ms).map_or(Self::MIN, |ms| Self(ms << TIMESTAMP_SHIFT))
    }

    /// Storage representation (`SQLite` integers are signed)
    #[must_use]
    #[allow(clippy::cast_possible_wrap)]
    pub const fn to_sql(self) -> i64 {
        self.0 as i64
    }

    /// Inverse of [`Snowflake::to_sql`]
    #[must_use]
    #[allow(clippy::cast_sign_loss)]
    pub const fn from_sql(raw: i64) -> Self {
        Self(raw as u64)
    }
}

impl fmt::Display for Snowflake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Snowflake {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(Self)
    }
}

impl<'de> Deserialize<'de> for Snowflake {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(u64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Number(id) => Ok(Self(id)),
            Raw::Text(id) => id.parse().map_err(serde::de::Error::custom),
        }
    }
}

impl From<u64> for Snowflake {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_discord_id_decodes() {
        // Discord's documented example snowflake
        let id = Snowflake(175_928_847_299_117_063);
        assert_eq!(id.timestamp().timestamp_millis(), 1_462_015_105_796);
    }

    #[test]
    fn from_datetime_orders_with_time() {
        let earlier = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let later = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 1).unwrap();

        let a = Snowflake::from_datetime(earlier);
        let b = Snowflake::from_datetime(later);
        assert!(a < b);
        assert_eq!(a.timestamp(), earlier);
    }

    #[test]
    fn pre_epoch_clamps_to_min() {
        let ancient = Utc.with_ymd_and_hms(2001, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(Snowflake::from_datetime(ancient), Snowflake::MIN);
    }

    #[test]
    fn parse_and_display() {
        let id: Snowflake = " 1234 ".parse().unwrap();
        assert_eq!(id, Snowflake(1234));
        assert_eq!(id.to_string(), "1234");
        assert_eq!(Snowflake::from_sql(id.to_sql()), id);
    }

    #[test]
    fn deserializes_quoted_and_bare_ids() {
        let quoted: Snowflake = serde_json::from_str("\"175928847299117063\"").unwrap();
        let bare: Snowflake = serde_json::from_str("175928847299117063").unwrap();
        assert_eq!(quoted, bare);
        assert!(serde_json::from_str::<Snowflake>("\"abc\"").is_err());
        assert_eq!(serde_json::to_string(&bare).unwrap(), "175928847299117063");
    }
}
