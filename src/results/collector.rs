//! Support and performance summaries of one run directory.
//!
//! Writes `results/<stem>.csv` (flattened capability dumps) and
//! `performance/<stem>.csv` (per-command latency statistics), where `<stem>`
//! is the device manufacturer, vendor string and firmware version.

use super::{capability, perf};
use crate::error::CollectError;
use crate::models::DeviceIdentity;
use chrono::Local;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

pub const RESULTS_DIR: &str = "results";
pub const PERFORMANCE_DIR: &str = "performance";

/// Paths of the two summaries written for a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Summaries {
    pub support: PathBuf,
    pub performance: PathBuf,
}

/// Builds both summaries from the raw detail tree.
pub struct ResultCollector {
    run_dir: PathBuf,
    detail_dir: PathBuf,
    image_tag: String,
    warmup_rows: BTreeMap<String, usize>,
    dump_prefix: String,
    perf_prefix: String,
}

impl ResultCollector {
    pub fn new(run_dir: &Path, detail_subdir: &str, image_tag: &str) -> Self {
        ResultCollector {
            run_dir: run_dir.to_path_buf(),
            detail_dir: run_dir.join(detail_subdir),
            image_tag: image_tag.to_string(),
            warmup_rows: BTreeMap::new(),
            dump_prefix: capability::DUMP_PREFIX.to_string(),
            perf_prefix: perf::PERF_PREFIX.to_string(),
        }
    }

    /// File name prefixes of the capability dumps and the performance detail files.
    pub fn with_prefixes(mut self, dump_prefix: &str, perf_prefix: &str) -> Self {
        self.dump_prefix = dump_prefix.to_string();
        self.perf_prefix = perf_prefix.to_string();
        self
    }

    /// Leading rows excluded from statistics, per command.
    pub fn with_warmup_rows(mut self, warmup_rows: BTreeMap<String, usize>) -> Self {
        self.warmup_rows = warmup_rows;
        self
    }

    fn preamble(&self, identity: &DeviceIdentity) -> String {
        format!(
            "Execution date/time:;{}\nImage tag:;{}\nManufacturer:;{}\nVendor string:;{}\nFirmware version:;{}\n\n",
            Local::now().format("%Y/%m/%d %H:%M:%S"),
            self.image_tag,
            identity.manufacturer,
            identity.vendor,
            identity.firmware
        )
    }

    /// Flattened capability listing.
    pub fn support_summary(&self, identity: &DeviceIdentity) -> Result<String, CollectError> {
        let mut out = self.preamble(identity);
        for dump in capability::load_dumps(&self.detail_dir, &self.dump_prefix)? {
            let _ = writeln!(out, "{}", dump.category);
            for entry in &dump.entries {
                let _ = writeln!(out, "{}", entry.flatten());
            }
            out.push('\n');
        }
        Ok(out)
    }

    /// Statistics of every performance detail file, grouped by command.
    pub fn performance_summary(&self, identity: &DeviceIdentity) -> Result<String, CollectError> {
        let mut out = self.preamble(identity);
        for (command, files) in perf::group_perf_files(&self.detail_dir, &self.perf_prefix)? {
            let skip = self.warmup_rows.get(&command).copied().unwrap_or(0);
            out.push_str(&perf::render_group(&command, &files, skip));
        }
        Ok(out)
    }

    /// Write both summaries into their trees.
    pub fn collect(&self, identity: &DeviceIdentity) -> Result<Summaries, CollectError> {
        if !self.detail_dir.is_dir() {
            return Err(CollectError::DetailDirMissing(
                self.detail_dir.display().to_string(),
            ));
        }
        let stem = identity.file_stem();

        let support = self.run_dir.join(RESULTS_DIR).join(format!("{}.csv", stem));
        let performance = self
            .run_dir
            .join(PERFORMANCE_DIR)
            .join(format!("{}.csv", stem));

        write_file(&support, &self.support_summary(identity)?)?;
        write_file(&performance, &self.performance_summary(identity)?)?;

        log::info!(
            "[Collector] Wrote {} and {}",
            support.display(),
            performance.display()
        );
        Ok(Summaries {
            support,
            performance,
        })
    }
}

fn write_file(path: &Path, content: &str) -> Result<(), CollectError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, content)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> DeviceIdentity {
        DeviceIdentity {
            manufacturer: "INTC".to_string(),
            vendor: "SLB9670".to_string(),
            firmware: "7.85.17.51968".to_string(),
        }
    }

    #[test]
    fn test_collect_writes_both_trees() {
        let dir = tempfile::tempdir().unwrap();
        let detail = dir.path().join("detail");
        std::fs::create_dir_all(&detail).unwrap();
        std::fs::write(
            detail.join("Quicktest_algorithms.txt"),
            "TPM2_ALG_RSA:\n  asymmetric: 1\n",
        )
        .unwrap();
        std::fs::write(
            detail.join("Perf_EncryptDecrypt:AES_128_CFB_encrypt.csv"),
            "duration,returncode\n9.0,0000\n0.001,0000\n0.002,0000\n0.0,0001\n",
        )
        .unwrap();

        let mut warmup = BTreeMap::new();
        warmup.insert("EncryptDecrypt".to_string(), 1);
        let collector = ResultCollector::new(dir.path(), "detail", "test-image").with_warmup_rows(warmup);
        let summaries = collector.collect(&identity()).unwrap();

        assert!(summaries
            .support
            .ends_with("results/INTC_SLB9670_7.85.17.51968.csv"));
        let support = std::fs::read_to_string(&summaries.support).unwrap();
        assert!(support.contains("Image tag:;test-image"));
        assert!(support.contains("TPM2_ALG_RSA;asymmetric=1"));

        let performance = std::fs::read_to_string(&summaries.performance).unwrap();
        assert!(performance.contains("TPM2_EncryptDecrypt"));
        assert!(performance.contains("avg op:;1.50;min op:;1.00;max op:;2.00"));
        assert!(performance.contains("total iterations:;3;successful:;2;failed:;1;error:;0001"));
    }

    #[test]
    fn test_malformed_detail_file_keeps_summary() {
        let dir = tempfile::tempdir().unwrap();
        let detail = dir.path().join("detail");
        std::fs::create_dir_all(&detail).unwrap();
        std::fs::write(detail.join("Perf_Create.csv"), "duration,returncode\n0.003,0000\n").unwrap();
        std::fs::write(detail.join("Perf_Sign:RSA_2048.csv"), "time;rc\n1;0\n").unwrap();

        let summaries = ResultCollector::new(dir.path(), "detail", "x")
            .collect(&identity())
            .unwrap();
        let performance = std::fs::read_to_string(&summaries.performance).unwrap();
        assert!(performance.contains("TPM2_Create"));
        assert!(performance.contains("avg op:;3.00"));
        assert!(performance.contains("TPM2_Sign"));
        assert!(performance.contains("lacks required column 'duration'"));
    }

    #[test]
    fn test_custom_prefixes() {
        let dir = tempfile::tempdir().unwrap();
        let detail = dir.path().join("detail");
        std::fs::create_dir_all(&detail).unwrap();
        std::fs::write(detail.join("Caps_algorithms.txt"), "TPM2_ALG_SHA256: 1\n").unwrap();
        std::fs::write(detail.join("Bench_Hash:SHA256_256.csv"), "duration,returncode\n0.001,0000\n").unwrap();
        std::fs::write(detail.join("Perf_Create.csv"), "duration,returncode\n0.001,0000\n").unwrap();

        let summaries = ResultCollector::new(dir.path(), "detail", "x")
            .with_prefixes("Caps_", "Bench_")
            .collect(&identity())
            .unwrap();
        let support = std::fs::read_to_string(&summaries.support).unwrap();
        assert!(support.contains("TPM2_ALG_SHA256;1"));
        let performance = std::fs::read_to_string(&summaries.performance).unwrap();
        assert!(performance.contains("TPM2_Hash"));
        assert!(!performance.contains("TPM2_Create"));
    }

    #[test]
    fn test_missing_detail_dir() {
        let dir = tempfile::tempdir().unwrap();
        let collector = ResultCollector::new(dir.path(), "detail", "x");
        assert!(matches!(
            collector.collect(&identity()),
            Err(CollectError::DetailDirMissing(_))
        ));
    }
}
