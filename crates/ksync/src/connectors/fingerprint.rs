//! 🪪 Fingerprint ids: `"{prefix}_{source id}"`, so two sources can't collide in one index.

pub fn fingerprint_id(prefix: &str, id: &str) -> String {
    format!("{prefix}_{id}")
}

/// The source id back out of a fingerprint, or `None` if it belongs to somebody else.
pub fn strip_fingerprint<'a>(prefix: &str, fingerprint: &'a str) -> Option<&'a str> {
    fingerprint
        .strip_prefix(prefix)?
        .strip_prefix('_')
        .filter(|id| !id.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn the_one_where_the_prefix_comes_and_goes() {
        let fp = fingerprint_id("google_drive", "abc_123");
        assert_eq!(fp, "google_drive_abc_123");
        assert_eq!(strip_fingerprint("google_drive", &fp), Some("abc_123"));
    }

    #[test]
    fn the_one_where_strangers_are_turned_away() {
        assert_eq!(strip_fingerprint("drive", "dropbox_1"), None);
        assert_eq!(strip_fingerprint("drive", "drive_"), None);
        assert_eq!(strip_fingerprint("drive", "drivex_1"), None);
    }
}
