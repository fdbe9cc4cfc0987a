//! Instance-type mapping between platforms.
//!
//! Pure and deterministic: an exact-match table consulted first, then a
//! weighted-distance fallback against the destination flavor catalog. No I/O
//! happens here, which is what makes mapping exhaustively unit-testable
//! independent of live cloud calls.

use crate::error::{MigrateError, MigrateResult};
use crate::provider::FlavorSpec;
use crate::types::ComputeProfile;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Weight of one vCPU of distance, relative to one GiB of memory.
const VCPU_WEIGHT: f64 = 1.0;
const MEMORY_GIB_WEIGHT: f64 = 1.0;

/// Source-type → destination-flavor mapping table plus the catalog the
/// fallback scorer searches. Read-only, shared across jobs, loaded once.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlavorMapping {
    /// Exact source instance-type name → destination flavor id.
    #[serde(default)]
    pub exact: HashMap<String, String>,
    /// Destination flavor catalog for fallback scoring.
    #[serde(default)]
    pub catalog: Vec<FlavorSpec>,
}

impl FlavorMapping {
    pub fn new(exact: HashMap<String, String>, catalog: Vec<FlavorSpec>) -> Self {
        Self { exact, catalog }
    }

    /// Load a mapping table from a JSON file.
    pub fn load(path: &Path) -> MigrateResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// The burned-in defaults for the common EC2 general-purpose families.
    pub fn builtin_exact_table() -> HashMap<String, String> {
        [
            ("t2.micro", "m1.tiny"),
            ("t2.small", "m1.small"),
            ("t2.medium", "m1.medium"),
            ("t2.large", "m1.large"),
            ("t2.xlarge", "m1.xlarge"),
            ("t3.micro", "m1.tiny"),
            ("t3.small", "m1.small"),
            ("t3.medium", "m1.medium"),
            ("t3.large", "m1.large"),
            ("m5.large", "m1.large"),
            ("m5.xlarge", "m1.xlarge"),
            ("m5.2xlarge", "m1.2xlarge"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    /// Map a source instance type and profile to a destination flavor id.
    ///
    /// Exact-match lookup first. On a miss, every catalog entry is scored by
    /// weighted distance in vCPU count and memory size and the smallest score
    /// wins; ties break to the smaller memory, then lexicographic id for
    /// determinism. Fails only when the catalog is empty.
    pub fn map(&self, instance_type: &str, profile: &ComputeProfile) -> MigrateResult<String> {
        if let Some(flavor_id) = self.exact.get(instance_type) {
            // An exact entry must still exist in the catalog if one is loaded.
            if self.catalog.is_empty() || self.catalog.iter().any(|f| &f.id == flavor_id) {
                tracing::debug!(instance_type, flavor = %flavor_id, "exact flavor match");
                return Ok(flavor_id.clone());
            }
            tracing::warn!(
                instance_type,
                flavor = %flavor_id,
                "exact mapping targets a flavor absent from the catalog, falling back to scoring"
            );
        }
        self.nearest(profile)
    }

    /// Fallback: nearest catalog entry by composite score.
    fn nearest(&self, profile: &ComputeProfile) -> MigrateResult<String> {
        let best = self
            .catalog
            .iter()
            .min_by(|a, b| {
                score(profile, a)
                    .total_cmp(&score(profile, b))
                    .then(a.memory_mib.cmp(&b.memory_mib))
                    .then(a.id.cmp(&b.id))
            })
            .ok_or_else(|| {
                MigrateError::UnmappableProfile(format!(
                    "destination flavor catalog is empty, cannot map {}",
                    profile
                ))
            })?;
        tracing::debug!(
            profile = %profile,
            flavor = %best.id,
            score = score(profile, best),
            "fallback flavor match"
        );
        Ok(best.id.clone())
    }
}

/// Weighted distance between a source profile and a catalog flavor.
fn score(profile: &ComputeProfile, flavor: &FlavorSpec) -> f64 {
    let dcpu = (profile.vcpus as f64 - flavor.vcpus as f64).abs();
    let dmem = (profile.memory_mib as f64 - flavor.memory_mib as f64).abs() / 1024.0;
    dcpu * VCPU_WEIGHT + dmem * MEMORY_GIB_WEIGHT
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn flavor(id: &str, vcpus: u32, memory_mib: u64) -> FlavorSpec {
        FlavorSpec {
            id: id.to_string(),
            vcpus,
            memory_mib,
            disk_gib: 0,
        }
    }

    fn profile(vcpus: u32, memory_mib: u64) -> ComputeProfile {
        ComputeProfile {
            vcpus,
            memory_mib,
            storage_gib: 0,
        }
    }

    fn catalog() -> Vec<FlavorSpec> {
        vec![
            flavor("m1.tiny", 1, 512),
            flavor("m1.small", 1, 2048),
            flavor("m1.medium", 2, 4096),
            flavor("m1.large", 4, 8192),
            flavor("m1.xlarge", 8, 16384),
        ]
    }

    #[test]
    fn exact_match_wins() {
        let mapping = FlavorMapping::new(FlavorMapping::builtin_exact_table(), catalog());
        assert_eq!(
            mapping.map("t3.medium", &profile(2, 4096)).unwrap(),
            "m1.medium"
        );
    }

    #[test]
    fn fallback_picks_nearest() {
        let mapping = FlavorMapping::new(HashMap::new(), catalog());
        // {2 vCPU, 4 GiB} scores 0 against m1.medium.
        assert_eq!(
            mapping.map("c7g.medium", &profile(2, 4096)).unwrap(),
            "m1.medium"
        );
        // {3 vCPU, 6 GiB}: m1.medium scores 3, m1.large scores 3; tie breaks
        // to the smaller memory.
        assert_eq!(
            mapping.map("c7g.large", &profile(3, 6144)).unwrap(),
            "m1.medium"
        );
    }

    #[test]
    fn fallback_with_missing_midpoint() {
        // Spec §8 scenario: {2 vCPU, 4 GiB} with no exact entry and a catalog
        // without the matching size must map to the nearest defined profile,
        // not error.
        let mapping = FlavorMapping::new(
            HashMap::new(),
            vec![flavor("d.small", 1, 2048), flavor("d.large", 4, 8192)],
        );
        // d.small: |2-1| + |4-2| = 3; d.large: |2-4| + |4-8| = 6.
        assert_eq!(
            mapping.map("t3.medium", &profile(2, 4096)).unwrap(),
            "d.small"
        );
    }

    #[test]
    fn exact_entry_absent_from_catalog_falls_back() {
        let mut exact = HashMap::new();
        exact.insert("t3.medium".to_string(), "m9.phantom".to_string());
        let mapping = FlavorMapping::new(exact, catalog());
        assert_eq!(
            mapping.map("t3.medium", &profile(2, 4096)).unwrap(),
            "m1.medium"
        );
    }

    #[test]
    fn empty_catalog_is_unmappable() {
        let mapping = FlavorMapping::new(HashMap::new(), vec![]);
        let err = mapping.map("t3.medium", &profile(2, 4096)).unwrap_err();
        assert!(matches!(err, MigrateError::UnmappableProfile(_)));
    }

    #[test]
    fn exact_match_without_catalog_still_resolves() {
        // A mapping file may carry only the exact table.
        let mapping = FlavorMapping::new(FlavorMapping::builtin_exact_table(), vec![]);
        assert_eq!(
            mapping.map("t2.micro", &profile(1, 1024)).unwrap(),
            "m1.tiny"
        );
    }

    #[test]
    fn tie_breaks_are_deterministic() {
        // Same score, same memory: lexicographic id decides.
        let mapping = FlavorMapping::new(
            HashMap::new(),
            vec![flavor("b.twin", 2, 4096), flavor("a.twin", 2, 4096)],
        );
        assert_eq!(
            mapping.map("x.unknown", &profile(2, 4096)).unwrap(),
            "a.twin"
        );
    }

    proptest! {
        /// The fallback always returns a flavor that exists in the catalog.
        #[test]
        fn fallback_result_is_in_catalog(
            vcpus in 1u32..128,
            memory_mib in 256u64..1_048_576,
        ) {
            let mapping = FlavorMapping::new(HashMap::new(), catalog());
            let id = mapping.map("unknown.type", &profile(vcpus, memory_mib)).unwrap();
            prop_assert!(mapping.catalog.iter().any(|f| f.id == id));
        }
    }
}
