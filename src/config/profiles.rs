//! Test profiles and the default stage plan they produce.

use crate::models::{PostProcess, StageKind, StageSpec};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// How thorough a run is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestProfile {
    /// A few hours at most
    Basic,
    Extensive,
}

impl TestProfile {
    /// Repetitions of each benchmarked operation.
    pub fn iterations(&self) -> u32 {
        match self {
            TestProfile::Basic => 1000,
            TestProfile::Extensive => 100_000,
        }
    }

    /// Bytes of RNG output to collect (16 KiB / 512 KiB).
    pub fn rng_bytes(&self) -> u32 {
        match self {
            TestProfile::Basic => 16_384,
            TestProfile::Extensive => 524_288,
        }
    }

    /// Default batch: probe first, then the percentage-tracked stages.
    pub fn default_stages(&self) -> Vec<StageSpec> {
        vec![
            StageSpec::capability_probe(),
            StageSpec::new("key generation", "keygen", StageKind::KeyGeneration)
                .with_args(&["--outdir", "{outdir}", "--num", "{iterations}"])
                .with_output_prefix("Keygen_")
                .with_post_process(PostProcess::RecoverKeys),
            StageSpec::new("performance", "perf", StageKind::Performance)
                .with_args(&["--outdir", "{outdir}", "--num", "{iterations}"])
                .with_output_prefix("Perf_"),
            StageSpec::new("random number generator", "rng", StageKind::Other)
                .with_args(&["--outdir", "{outdir}", "--bytes", "{rng_bytes}"])
                .with_output_prefix("Rng"),
        ]
    }
}

impl FromStr for TestProfile {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "basic" | "short" => Ok(TestProfile::Basic),
            "extensive" | "long" => Ok(TestProfile::Extensive),
            other => Err(format!("Unknown test profile: {}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_parameters() {
        assert_eq!(TestProfile::Basic.iterations(), 1000);
        assert_eq!(TestProfile::Extensive.rng_bytes(), 524_288);
    }

    #[test]
    fn test_default_stages_start_with_probe() {
        let stages = TestProfile::Basic.default_stages();
        assert_eq!(stages[0].kind, StageKind::CapabilityProbe);
        let keygen = stages
            .iter()
            .find(|s| s.kind == StageKind::KeyGeneration)
            .unwrap();
        assert_eq!(keygen.post_process, Some(PostProcess::RecoverKeys));
    }

    #[test]
    fn test_profile_from_str() {
        assert_eq!("Extensive".parse::<TestProfile>(), Ok(TestProfile::Extensive));
        assert!("quick".parse::<TestProfile>().is_err());
    }
}
