//! Cache key derived from the configuration fields that determine image content.

use crate::config::BuildConfiguration;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Two fingerprints match iff every field is equal. The update list is kept
/// sorted, so update order never matters but update content always does.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheFingerprint {
    pub edition: String,
    pub sector_size: u32,
    pub release: u32,
    pub version: String,
    pub optional_features: Vec<String>,
    /// Sorted lexicographically
    pub updates: Vec<String>,
}

impl CacheFingerprint {
    pub fn new(
        edition: impl Into<String>,
        sector_size: u32,
        release: u32,
        version: impl Into<String>,
        optional_features: Vec<String>,
        mut updates: Vec<String>,
    ) -> Self {
        updates.sort();
        CacheFingerprint {
            edition: edition.into(),
            sector_size,
            release,
            version: version.into(),
            optional_features,
            updates,
        }
    }

    pub fn from_config(config: &BuildConfiguration) -> Self {
        Self::new(
            config.edition.clone(),
            config.sector_size.bytes(),
            config.release,
            config.version.clone(),
            config.optional_features.clone(),
            config.update_file_names(),
        )
    }

    /// Field-wise comparison. Manifests written by hand may carry an unsorted
    /// update list, so both sides are compared as sorted sequences.
    pub fn matches(&self, other: &CacheFingerprint) -> bool {
        if self.edition != other.edition
            || self.sector_size != other.sector_size
            || self.release != other.release
            || self.version != other.version
            || self.optional_features != other.optional_features
            || self.updates.len() != other.updates.len()
        {
            return false;
        }
        let mut mine = self.updates.clone();
        let mut theirs = other.updates.clone();
        mine.sort();
        theirs.sort();
        mine == theirs
    }
}

impl fmt::Display for CacheFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} ({}B sectors, {} feature(s), {} update(s))",
            self.edition,
            self.release,
            self.version,
            self.sector_size,
            self.optional_features.len(),
            self.updates.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn base() -> CacheFingerprint {
        CacheFingerprint::new(
            "Pro",
            512,
            11,
            "24H2",
            vec![],
            vec!["KB1.msu".to_string(), "KB2.msu".to_string()],
        )
    }

    #[test]
    fn test_single_field_change_breaks_match() {
        let reference = base();
        let variants = vec![
            CacheFingerprint { edition: "Enterprise".into(), ..base() },
            CacheFingerprint { sector_size: 4096, ..base() },
            CacheFingerprint { release: 10, ..base() },
            CacheFingerprint { version: "23H2".into(), ..base() },
            CacheFingerprint { optional_features: vec!["NetFx3".into()], ..base() },
            CacheFingerprint { updates: vec!["KB1.msu".into(), "KB3.msu".into()], ..base() },
        ];
        for variant in variants {
            assert!(!reference.matches(&variant), "{:?} should not match", variant);
            assert_ne!(reference, variant);
        }
    }

    #[test]
    fn test_subset_and_superset_do_not_match() {
        let reference = base();
        let subset = CacheFingerprint { updates: vec!["KB1.msu".into()], ..base() };
        let superset = CacheFingerprint {
            updates: vec!["KB1.msu".into(), "KB2.msu".into(), "KB3.msu".into()],
            ..base()
        };
        assert!(!reference.matches(&subset));
        assert!(!reference.matches(&superset));
    }

    #[test]
    fn test_hand_written_unsorted_manifest_still_matches() {
        let unsorted = CacheFingerprint {
            updates: vec!["KB2.msu".into(), "KB1.msu".into()],
            ..base()
        };
        assert!(base().matches(&unsorted));
    }

    proptest! {
        #[test]
        fn prop_update_order_is_irrelevant(updates in proptest::collection::vec("[A-Za-z0-9]{1,12}\\.msu", 0..8), seed in any::<u64>()) {
            let forward = CacheFingerprint::new("Pro", 512, 11, "24H2", vec![], updates.clone());
            // Deterministic shuffle driven by the seed
            let mut reordered = updates.clone();
            let mut s = seed;
            for i in (1..reordered.len()).rev() {
                s = s.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                reordered.swap(i, (s % (i as u64 + 1)) as usize);
            }
            let shuffled = CacheFingerprint::new("Pro", 512, 11, "24H2", vec![], reordered);
            prop_assert_eq!(&forward, &shuffled);
            prop_assert!(forward.matches(&shuffled));
        }
    }
}
