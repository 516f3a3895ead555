//! Response nonces: `YYYY-MM-DDTHH:MM:SSZ` followed by a provider-chosen salt.

use base64::Engine;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime};

/// Allowed clock difference between provider and consumer, in seconds.
pub const SKEW_SECS: i64 = 5 * 60 * 60;

const TIMESTAMP_LEN: usize = 20;

/// Split a nonce into its Unix timestamp and salt.
pub fn split(nonce: &str) -> Option<(i64, &str)> {
    let stamp = nonce.get(..TIMESTAMP_LEN)?;
    let salt = nonce.get(TIMESTAMP_LEN..)?;
    let format = format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]Z");
    let parsed = PrimitiveDateTime::parse(stamp, format).ok()?;
    Some((parsed.assume_utc().unix_timestamp(), salt))
}

pub fn within_skew(timestamp: i64, now: i64) -> bool {
    (now - timestamp).abs() <= SKEW_SECS
}

pub fn now() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

/// Fresh nonce for OpenID 1 requests, which carry it in `return_to`.
pub fn make() -> Result<String, getrandom::Error> {
    let format = format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]Z");
    let stamp = OffsetDateTime::now_utc()
        .format(format)
        .unwrap_or_default();
    let mut salt = [0u8; 6];
    getrandom::fill(&mut salt)?;
    Ok(format!(
        "{stamp}{}",
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(salt)
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_timestamp_and_salt() {
        let (ts, salt) = split("2005-05-15T17:11:51ZUNIQUE").unwrap();
        assert_eq!(ts, 1_116_177_111);
        assert_eq!(salt, "UNIQUE");
    }

    #[test]
    fn empty_salt_allowed() {
        assert_eq!(split("1970-01-01T00:00:00Z"), Some((0, "")));
    }

    #[test]
    fn rejects_garbage() {
        assert!(split("yesterday").is_none());
        assert!(split("2005-05-15 17:11:51ZX").is_none());
    }

    #[test]
    fn skew_window() {
        assert!(within_skew(1_000, 1_000 + SKEW_SECS));
        assert!(!within_skew(1_000, 1_001 + SKEW_SECS));
        assert!(within_skew(1_000 + SKEW_SECS, 1_000));
    }

    #[test]
    fn made_nonce_parses() {
        let n = make().unwrap();
        let (ts, salt) = split(&n).unwrap();
        assert!(within_skew(ts, now()));
        assert!(!salt.is_empty());
    }
}
