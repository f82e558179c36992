//! Performance detail files (`Perf_<Command>[:<param>_<param>...].csv`) and their statistics.

use crate::error::CollectError;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

pub const PERF_PREFIX: &str = "Perf_";

/// File name split into command and parameter list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PerfFileName {
    pub command: String,
    pub params: Vec<String>,
}

impl PerfFileName {
    pub fn parse(path: &Path) -> Option<Self> {
        PerfFileName::parse_with_prefix(path, PERF_PREFIX)
    }

    /// Parse a detail file named `<prefix><Command>[:params].csv`.
    pub fn parse_with_prefix(path: &Path, prefix: &str) -> Option<Self> {
        let name = path.file_name()?.to_str()?;
        let stem = name.strip_prefix(prefix)?.strip_suffix(".csv")?;
        let (command, params) = match stem.split_once(':') {
            Some((command, params)) => (
                command,
                params
                    .split('_')
                    .filter(|p| !p.is_empty())
                    .map(|p| p.to_string())
                    .collect(),
            ),
            None => (stem, Vec::new()),
        };
        if command.is_empty() {
            return None;
        }
        Some(PerfFileName {
            command: command.to_string(),
            params,
        })
    }
}

/// Command families with a dedicated parameter header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandFamily {
    Random,
    Signing,
    EncryptDecrypt,
    Hash,
    Hmac,
    Generic,
}

impl CommandFamily {
    pub fn of(command: &str) -> Self {
        match command {
            "GetRandom" => CommandFamily::Random,
            "Sign" | "VerifySignature" => CommandFamily::Signing,
            "EncryptDecrypt" | "EncryptDecrypt2" => CommandFamily::EncryptDecrypt,
            "Hash" => CommandFamily::Hash,
            "HMAC" | "Hmac" => CommandFamily::Hmac,
            _ => CommandFamily::Generic,
        }
    }

    /// Human-readable parameter header for one detail file.
    pub fn header(&self, params: &[String]) -> String {
        let param = |i: usize| params.get(i).map(String::as_str).unwrap_or("-");
        match self {
            CommandFamily::Random => format!("Data length (bytes):;{}", param(0)),
            CommandFamily::Signing => match params.split_last() {
                Some((scheme, key)) if !key.is_empty() => {
                    format!("Key parameters:;{};Scheme:;{}", key.join(" "), scheme)
                }
                _ => format!("Key parameters:;{};Scheme:;-", param(0)),
            },
            CommandFamily::EncryptDecrypt => format!(
                "Algorithm:;{};Key length:;{};Mode:;{};Encrypt/decrypt?:;{}",
                param(0),
                param(1),
                param(2),
                param(3)
            ),
            CommandFamily::Hash => {
                format!("Hash algorithm:;{};Data length (bytes):;{}", param(0), param(1))
            }
            CommandFamily::Hmac => format!("Hash algorithm:;{}", param(0)),
            CommandFamily::Generic if params.is_empty() => "Parameters:;-".to_string(),
            CommandFamily::Generic => format!("Parameters:;{}", params.join(";")),
        }
    }
}

/// One measured operation.
#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    /// Seconds, as stored by the tool
    pub duration: f64,
    pub return_code: String,
}

impl Measurement {
    /// A return code made of zero digits only.
    pub fn is_success(&self) -> bool {
        let code = self.return_code.trim();
        let digits = code
            .strip_prefix("0x")
            .or_else(|| code.strip_prefix("0X"))
            .unwrap_or(code);
        !digits.is_empty() && digits.chars().all(|c| c == '0')
    }
}

/// Latency statistics of one detail file, in milliseconds.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PerfStats {
    pub success: usize,
    pub failed: usize,
    pub total: usize,
    pub min_ms: f64,
    pub avg_ms: f64,
    pub max_ms: f64,
    pub last_error: Option<String>,
}

impl PerfStats {
    /// Statistics over `rows`, ignoring the first `skip` of them.
    ///
    /// Min/avg/max cover successful operations only and are 0 when there are none.
    pub fn compute(rows: &[Measurement], skip: usize) -> Self {
        let mut stats = PerfStats::default();
        let mut sum = 0.0;
        let mut min = f64::INFINITY;
        let mut max = 0.0f64;

        for row in rows.iter().skip(skip) {
            stats.total += 1;
            if row.is_success() {
                let ms = row.duration * 1000.0;
                stats.success += 1;
                sum += ms;
                min = min.min(ms);
                max = max.max(ms);
            } else {
                stats.failed += 1;
                stats.last_error = Some(row.return_code.trim().to_string());
            }
        }

        if stats.success > 0 {
            stats.min_ms = min;
            stats.max_ms = max;
            stats.avg_ms = sum / stats.success as f64;
        }
        stats
    }

    /// Two summary lines, `;`-separated.
    pub fn render(&self) -> String {
        format!(
            "operation stats (ms/op):;avg op:;{:.2};min op:;{:.2};max op:;{:.2}\n\
             operation info:;total iterations:;{};successful:;{};failed:;{};error:;{}",
            self.avg_ms,
            self.min_ms,
            self.max_ms,
            self.total,
            self.success,
            self.failed,
            self.last_error.as_deref().unwrap_or("None")
        )
    }
}

/// Delimiter of a detail file, decided from its header row.
fn detect_delimiter(header: &str) -> u8 {
    if header.matches(';').count() > header.matches(',').count() {
        b';'
    } else {
        b','
    }
}

/// Read every measurement of a detail file.
pub fn read_measurements(path: &Path) -> Result<Vec<Measurement>, CollectError> {
    let content = std::fs::read_to_string(path)?;
    let header = content.lines().next().unwrap_or_default();

    let mut reader = csv::ReaderBuilder::new()
        .delimiter(detect_delimiter(header))
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(content.as_bytes());

    let headers = reader.headers()?.clone();
    let find = |names: &[&str]| headers.iter().position(|h| names.contains(&h));
    let missing = |column: &str| CollectError::MissingColumn {
        file: path.display().to_string(),
        column: column.to_string(),
    };
    let duration_col = find(&["duration"]).ok_or_else(|| missing("duration"))?;
    let code_col = find(&["returncode", "return_code"]).ok_or_else(|| missing("returncode"))?;

    let mut rows = Vec::new();
    for (index, record) in reader.records().enumerate() {
        let record = record?;
        let duration = record.get(duration_col).and_then(|d| d.parse::<f64>().ok());
        let code = record.get(code_col);
        match (duration, code) {
            (Some(duration), Some(code)) => rows.push(Measurement {
                duration,
                return_code: code.to_string(),
            }),
            _ => log::warn!(
                "[Perf] {} row {}: unreadable measurement, skipped",
                path.display(),
                index + 1
            ),
        }
    }
    Ok(rows)
}

/// One detail file with its parsed name.
#[derive(Debug, Clone)]
pub struct PerfFile {
    pub path: PathBuf,
    pub name: PerfFileName,
}

/// Detail files starting with `prefix`, grouped by command, both levels sorted.
pub fn group_perf_files(
    detail_dir: &Path,
    prefix: &str,
) -> std::io::Result<Vec<(String, Vec<PerfFile>)>> {
    let mut files: Vec<PerfFile> = std::fs::read_dir(detail_dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter_map(|path| {
            PerfFileName::parse_with_prefix(&path, prefix).map(|name| PerfFile { path, name })
        })
        .collect();
    files.sort_by(|a, b| {
        a.name
            .command
            .cmp(&b.name.command)
            .then_with(|| a.path.cmp(&b.path))
    });

    let mut groups: Vec<(String, Vec<PerfFile>)> = Vec::new();
    for file in files {
        match groups.last_mut() {
            Some((command, group)) if *command == file.name.command => group.push(file),
            _ => groups.push((file.name.command.clone(), vec![file])),
        }
    }
    Ok(groups)
}

/// Summary section of one command group.
///
/// A detail file that cannot be read gets an `error:` line instead of statistics;
/// the rest of the group is still rendered.
pub fn render_group(command: &str, files: &[PerfFile], skip: usize) -> String {
    let family = CommandFamily::of(command);
    let mut out = String::new();
    let _ = writeln!(out, "TPM2_{}", command);
    for file in files {
        let _ = writeln!(out, "{}", family.header(&file.name.params));
        match read_measurements(&file.path) {
            Ok(rows) => {
                let _ = writeln!(out, "{}", PerfStats::compute(&rows, skip).render());
            }
            Err(e) => {
                log::warn!("[Perf] Skipping {}: {}", file.path.display(), e);
                let _ = writeln!(out, "error:;{}", e);
            }
        }
        out.push('\n');
    }
    out
}
