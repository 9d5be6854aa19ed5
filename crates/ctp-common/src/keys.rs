//! Deterministic surrogate keys
//!
//! Normalized tables are keyed by a digest of their natural identifying
//! attributes so that re-ingesting the same logical entity, in any process,
//! yields the same key.

/// Separator placed between natural key parts before hashing.
pub const KEY_DELIMITER: &str = "|";

/// Number of hex characters kept from the digest.
pub const KEY_LENGTH: usize = 16;

/// Stand-in for an absent part of a composite key.
pub const ABSENT_PART: &str = "";

/// Derive a surrogate key from natural key parts.
///
/// Parts are joined with [`KEY_DELIMITER`], hashed with MD5 and truncated to
/// [`KEY_LENGTH`] lowercase hex characters. An absent part keeps its position
/// as [`ABSENT_PART`], so `(facility, None, country)` and
/// `(None, city, country)` never share a key. Keys whose parts are all present
/// are unaffected.
pub fn surrogate_key(parts: &[Option<&str>]) -> String {
    let combined = parts
        .iter()
        .map(|part| part.unwrap_or(ABSENT_PART))
        .collect::<Vec<_>>()
        .join(KEY_DELIMITER);

    let mut hex = format!("{:x}", md5::compute(combined.as_bytes()));
    hex.truncate(KEY_LENGTH);
    hex
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_surrogate_key_known_digest() {
        assert_eq!(surrogate_key(&[Some("NCT001")]), "347ddc49f3db2b93");
        assert_eq!(surrogate_key(&[Some("Acme")]), "79d894520f4f94c2");
    }

    #[test]
    fn test_surrogate_key_is_stable() {
        let first = surrogate_key(&[Some("Mayo Clinic"), Some("Rochester"), Some("United States")]);
        let second = surrogate_key(&[Some("Mayo Clinic"), Some("Rochester"), Some("United States")]);
        assert_eq!(first, second);
        assert_eq!(first.len(), KEY_LENGTH);
    }

    #[test]
    fn test_surrogate_key_absent_parts_keep_their_position() {
        assert_eq!(surrogate_key(&[Some("hello world")]), "5eb63bbbe01eeed0");
        assert_eq!(surrogate_key(&[Some("hello world"), None]), "1ef369cfd1cc04c9");

        let facility_only = surrogate_key(&[Some("Boston"), None, Some("US")]);
        let city_only = surrogate_key(&[None, Some("Boston"), Some("US")]);
        assert_ne!(facility_only, city_only);
    }

    #[test]
    fn test_surrogate_key_distinguishes_roles() {
        let lead = surrogate_key(&[Some("study"), Some("sponsor"), Some("lead")]);
        let collab = surrogate_key(&[Some("study"), Some("sponsor"), Some("collab")]);
        assert_ne!(lead, collab);
    }
}
