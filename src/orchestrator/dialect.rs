//! Command-line dialects of the test tool.
//!
//! Older tool releases take the test category through an explicit `-s` flag,
//! newer ones take it positionally. The dialect is chosen once, from the
//! tool's `--version` output, during the capability probe.

use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;

static VERSION_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d+)\.(\d+)(?:\.(\d+))?").expect("Invalid version regex"));

/// `major.minor.patch` of the test tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ToolVersion(pub u32, pub u32, pub u32);

impl ToolVersion {
    /// First `X.Y[.Z]` found in the text.
    pub fn parse(text: &str) -> Option<Self> {
        let caps = VERSION_REGEX.captures(text)?;
        let major = caps[1].parse().ok()?;
        let minor = caps[2].parse().ok()?;
        let patch = caps.get(3).map_or(Some(0), |m| m.as_str().parse().ok())?;
        Some(ToolVersion(major, minor, patch))
    }
}

impl fmt::Display for ToolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.0, self.1, self.2)
    }
}

/// Builds the argument vector for one stage.
pub trait CommandDialect: Send + Sync {
    fn name(&self) -> &'static str;

    /// Full argument list for `category` followed by the stage's own arguments.
    fn stage_args(&self, category: &str, stage_args: &[String]) -> Vec<String>;
}

/// `tool -s <category> ...`
pub struct LegacyDialect;

impl CommandDialect for LegacyDialect {
    fn name(&self) -> &'static str {
        "legacy"
    }

    fn stage_args(&self, category: &str, stage_args: &[String]) -> Vec<String> {
        let mut args = vec!["-s".to_string(), category.to_string()];
        args.extend(stage_args.iter().cloned());
        args
    }
}

/// `tool <category> ...`
pub struct PositionalDialect;

impl CommandDialect for PositionalDialect {
    fn name(&self) -> &'static str {
        "positional"
    }

    fn stage_args(&self, category: &str, stage_args: &[String]) -> Vec<String> {
        let mut args = vec![category.to_string()];
        args.extend(stage_args.iter().cloned());
        args
    }
}

/// Select the dialect from raw `--version` output.
///
/// Unparsable output selects the legacy dialect: the explicit flag is accepted
/// by every release.
pub fn select_dialect(version_output: &str, modern_since: ToolVersion) -> Box<dyn CommandDialect> {
    match ToolVersion::parse(version_output) {
        Some(version) if version >= modern_since => {
            log::info!("[Dialect] Tool version {} -> positional categories", version);
            Box::new(PositionalDialect)
        }
        Some(version) => {
            log::info!("[Dialect] Tool version {} -> legacy '-s' flag", version);
            Box::new(LegacyDialect)
        }
        None => {
            log::warn!("[Dialect] Could not parse tool version from '{}'", version_output.trim());
            Box::new(LegacyDialect)
        }
    }
}
