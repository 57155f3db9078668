//! Size and count quotas for namespaces and repositories.

use crate::error::{RegistryError, RegistryResult};

const UNITS: [&str; 6] = ["B", "KiB", "MiB", "GiB", "TiB", "PiB"];

/// Format a byte count with binary units, e.g. `1.50 MiB`.
pub fn humanize(bytes: i64) -> String {
    if bytes.unsigned_abs() < 1024 {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value.abs() >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.2} {}", UNITS[unit])
}

/// Check that growing `current` by `increase` stays within `limit`.
///
/// A limit of zero or less means unlimited.
pub fn check_size(
    scope: &str,
    name: &str,
    current: i64,
    limit: i64,
    increase: i64,
) -> RegistryResult<()> {
    if limit <= 0 || current + increase <= limit {
        return Ok(());
    }
    let percent = current as f64 * 100.0 / limit as f64;
    Err(RegistryError::QuotaExceeded(format!(
        "{scope} {name} size quota exceeded: current {} ({percent:.2}% of limit {}), increase {}",
        humanize(current),
        humanize(limit),
        humanize(increase),
    )))
}

/// Check that adding one more item keeps `count` within `limit`.
pub fn check_count(scope: &str, name: &str, what: &str, count: i64, limit: i64) -> RegistryResult<()> {
    if limit <= 0 || count < limit {
        return Ok(());
    }
    Err(RegistryError::QuotaExceeded(format!(
        "{scope} {name} {what} quota exceeded: {count} of {limit} used"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn humanizes_binary_units() {
        assert_eq!(humanize(0), "0 B");
        assert_eq!(humanize(1023), "1023 B");
        assert_eq!(humanize(1024), "1.00 KiB");
        assert_eq!(humanize(1536 * 1024), "1.50 MiB");
    }

    #[test]
    fn size_message_names_every_figure() {
        assert!(check_size("namespace", "library", 10, 0, 1 << 40).is_ok());
        assert!(check_size("namespace", "library", 512, 1024, 512).is_ok());

        let err = check_size("namespace", "library", 512 * 1024, 1024 * 1024, 1024 * 1024)
            .unwrap_err();
        assert_eq!(err.error_code(), "DENIED");
        let message = err.to_string();
        assert!(message.contains("512.00 KiB"), "{message}");
        assert!(message.contains("50.00%"), "{message}");
        assert!(message.contains("limit 1.00 MiB"), "{message}");
        assert!(message.contains("increase 1.00 MiB"), "{message}");
    }

    #[test]
    fn count_limit() {
        assert!(check_count("repository", "library/app", "tag", 4, 5).is_ok());
        assert!(check_count("repository", "library/app", "tag", 5, 5).is_err());
        assert!(check_count("repository", "library/app", "tag", 500, 0).is_ok());
    }
}
