//! Lookup-key normalization.

/// A caller-supplied key paired with its canonical comparison form.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LookupKey {
    /// Trimmed key as first supplied; this is what goes over the wire.
    pub raw: String,
    /// Trimmed, case-folded key used for cache and queue indexing.
    pub normalized: String,
}

impl LookupKey {
    pub fn new(raw: &str) -> Self {
        let raw = raw.trim();
        Self {
            raw: raw.to_string(),
            normalized: normalize_key(raw),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }
}

/// Reduces a key to the form used for equivalence checks.
pub fn normalize_key(raw: &str) -> String {
    raw.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::{normalize_key, LookupKey};

    #[test]
    fn test_normalize_key_trims_and_folds_case() {
        assert_eq!(normalize_key("  Muse "), "muse");
        assert_eq!(normalize_key("MUSE"), normalize_key("muse"));
        assert_eq!(normalize_key("Ämmä"), "ämmä");
    }

    #[test]
    fn test_lookup_key_keeps_trimmed_raw_form() {
        let key = LookupKey::new(" Muse ");
        assert_eq!(key.raw, "Muse");
        assert_eq!(key.normalized, "muse");
        assert!(LookupKey::new(" \t ").is_empty());
    }
}
