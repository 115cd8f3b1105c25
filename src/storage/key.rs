//! Backup object key generation.

use chrono::{DateTime, Utc};

/// Generate the destination key for an archived table:
/// `[prefix/]<YYYY-MM-DD>/<table>.json`.
pub fn backup_key(prefix: Option<&str>, table: &str) -> String {
    backup_key_from(prefix, table, Utc::now())
}

/// Generate a key from a specific timestamp (for testing).
fn backup_key_from(prefix: Option<&str>, table: &str, now: DateTime<Utc>) -> String {
    let date = now.format("%Y-%m-%d");
    match prefix {
        Some(prefix) if !prefix.is_empty() => format!("{prefix}/{date}/{table}.json"),
        _ => format!("{date}/{table}.json"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_key_without_prefix() {
        let now = Utc.with_ymd_and_hms(2026, 1, 28, 14, 30, 0).unwrap();
        assert_eq!(
            backup_key_from(None, "orders", now),
            "2026-01-28/orders.json"
        );
    }

    #[test]
    fn test_key_with_prefix() {
        let now = Utc.with_ymd_and_hms(2026, 1, 28, 14, 30, 0).unwrap();
        assert_eq!(
            backup_key_from(Some("backups/prod"), "orders", now),
            "backups/prod/2026-01-28/orders.json"
        );
    }

    #[test]
    fn test_empty_prefix_is_ignored() {
        let now = Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap();
        assert_eq!(backup_key_from(Some(""), "orders", now), "2026-02-01/orders.json");
    }
}
