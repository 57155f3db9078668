//! Durations written as strings with a unit suffix: `"100ms"`, `"30s"`,
//! `"15m"`, `"72h"`, `"7d"`. Several terms may be chained (`"1h30m"`).

use std::time::Duration;

use serde::{Deserialize, Deserializer, de};

use super::ConfigError;

/// Parse a duration string.
pub fn parse(input: &str) -> Result<Duration, ConfigError> {
    let text = input.trim();
    if text.is_empty() {
        return Err(ConfigError::Duration(input.to_owned()));
    }
    if text == "0" {
        return Ok(Duration::ZERO);
    }

    let mut total = Duration::ZERO;
    let mut rest = text;
    while !rest.is_empty() {
        let digits = rest
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(|| ConfigError::Duration(input.to_owned()))?;
        if digits == 0 {
            return Err(ConfigError::Duration(input.to_owned()));
        }
        let value: u64 = rest[..digits]
            .parse()
            .map_err(|_| ConfigError::Duration(input.to_owned()))?;
        rest = &rest[digits..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit())
            .unwrap_or(rest.len());
        let unit = &rest[..unit_len];
        rest = &rest[unit_len..];

        let term = match unit {
            "ms" => Duration::from_millis(value),
            "s" => Duration::from_secs(value),
            "m" => Duration::from_secs(value.saturating_mul(60)),
            "h" => Duration::from_secs(value.saturating_mul(3600)),
            "d" => Duration::from_secs(value.saturating_mul(86_400)),
            _ => return Err(ConfigError::Duration(input.to_owned())),
        };
        total = total.saturating_add(term);
    }
    Ok(total)
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Raw {
    Text(String),
    Seconds(u64),
}

/// `#[serde(deserialize_with)]` helper accepting a duration string or a
/// number of seconds.
pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    match Raw::deserialize(deserializer)? {
        Raw::Text(text) => parse(&text).map_err(de::Error::custom),
        Raw::Seconds(secs) => Ok(Duration::from_secs(secs)),
    }
}

/// Like [`deserialize`], for optional fields.
pub fn deserialize_option<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Raw>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Raw::Text(text)) if text.trim().is_empty() => Ok(None),
        Some(Raw::Text(text)) => parse(&text).map(Some).map_err(de::Error::custom),
        Some(Raw::Seconds(secs)) => Ok(Some(Duration::from_secs(secs))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn units() {
        assert_eq!(parse("100ms").unwrap(), Duration::from_millis(100));
        assert_eq!(parse("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse("15m").unwrap(), Duration::from_secs(900));
        assert_eq!(parse("72h").unwrap(), Duration::from_secs(72 * 3600));
        assert_eq!(parse("7d").unwrap(), Duration::from_secs(7 * 86_400));
        assert_eq!(parse("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse("0").unwrap(), Duration::ZERO);
    }

    #[test]
    fn rejects_garbage() {
        for bad in ["", "10", "h", "5y", "1.5h", "-3s"] {
            assert!(parse(bad).is_err(), "{bad:?} should not parse");
        }
    }
}
