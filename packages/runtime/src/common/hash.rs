use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Generate a time-ordered UUID v7 for database primary keys.
pub fn db_id() -> Uuid {
    Uuid::now_v7()
}

/// Generate a content hash for duplicate and change detection.
///
/// Uses SHA256 of normalized text. Normalization rules:
/// - Convert to lowercase
/// - Remove all non-alphanumeric characters (except spaces)
/// - Collapse multiple spaces into single spaces
/// - Trim leading/trailing whitespace
pub fn generate_content_hash(text: &str) -> String {
    let normalized = text
        .to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");

    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Hash an exact byte sequence without normalization.
///
/// Steering signatures use this: two polls must only short-circuit when the
/// pending message set is byte-identical.
pub fn exact_hash(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn db_ids_are_unique() {
        assert_ne!(db_id(), db_id());
    }

    #[test]
    fn content_hash_is_case_insensitive() {
        assert_eq!(
            generate_content_hash("Deploy the staging branch!"),
            generate_content_hash("deploy the STAGING branch")
        );
    }

    #[test]
    fn content_hash_detects_changes() {
        assert_ne!(
            generate_content_hash("deploy staging"),
            generate_content_hash("deploy production")
        );
    }

    #[test]
    fn exact_hash_is_order_sensitive() {
        assert_ne!(exact_hash(&["a", "b"]), exact_hash(&["b", "a"]));
    }

    #[test]
    fn exact_hash_separates_parts() {
        // "ab" + "c" must not collide with "a" + "bc"
        assert_ne!(exact_hash(&["ab", "c"]), exact_hash(&["a", "bc"]));
    }
}
