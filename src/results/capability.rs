//! Capability dump parsing (`Quicktest_<category>.txt`).
//!
//! A dump is a list of entries. An entry is either a single `NAME: value`
//! line or a `NAME:` header followed by indented `key: value` lines.

use crate::error::ProbeError;
use crate::models::DeviceIdentity;
use std::path::{Path, PathBuf};

pub const DUMP_PREFIX: &str = "Quicktest_";
pub const FIXED_PROPERTIES: &str = "properties-fixed";

/// Summary order of the well-known categories; anything else follows alphabetically.
const CATEGORY_ORDER: &[&str] = &[
    "properties-fixed",
    "properties-variable",
    "algorithms",
    "commands",
    "ecc-curves",
];

/// One entry of a capability dump.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CapabilityEntry {
    Property { name: String, value: String },
    Group { name: String, fields: Vec<(String, String)> },
}

impl CapabilityEntry {
    pub fn name(&self) -> &str {
        match self {
            CapabilityEntry::Property { name, .. } | CapabilityEntry::Group { name, .. } => name,
        }
    }

    /// Scalar value: the property value, or a group's `raw`/`value` field.
    pub fn value(&self) -> Option<&str> {
        match self {
            CapabilityEntry::Property { value, .. } => Some(value),
            CapabilityEntry::Group { fields, .. } => fields
                .iter()
                .find(|(k, _)| k == "raw")
                .or_else(|| fields.iter().find(|(k, _)| k == "value"))
                .map(|(_, v)| v.as_str()),
        }
    }

    /// One `;`-joined summary line.
    pub fn flatten(&self) -> String {
        match self {
            CapabilityEntry::Property { name, value } => format!("{};{}", name, value),
            CapabilityEntry::Group { name, fields } => {
                let mut line = name.clone();
                for (key, value) in fields {
                    line.push(';');
                    line.push_str(key);
                    line.push('=');
                    line.push_str(value);
                }
                line
            }
        }
    }
}

/// A parsed dump file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilityDump {
    pub category: String,
    pub entries: Vec<CapabilityEntry>,
}

impl CapabilityDump {
    pub fn get(&self, name: &str) -> Option<&CapabilityEntry> {
        self.entries.iter().find(|e| e.name() == name)
    }
}

fn split_pair(line: &str) -> Option<(String, String)> {
    let (key, value) = line.split_once(':')?;
    Some((key.trim().to_string(), value.trim().to_string()))
}

/// Parse the text of one dump.
pub fn parse_dump(text: &str) -> Vec<CapabilityEntry> {
    let mut entries = Vec::new();
    let mut group: Option<(String, Vec<(String, String)>)> = None;

    for line in text.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let indented = line.starts_with(' ') || line.starts_with('\t');

        if indented {
            if let (Some((_, fields)), Some(pair)) = (group.as_mut(), split_pair(line)) {
                fields.push(pair);
                continue;
            }
        }

        if let Some((name, fields)) = group.take() {
            entries.push(CapabilityEntry::Group { name, fields });
        }

        match split_pair(line) {
            Some((name, value)) if value.is_empty() => group = Some((name, Vec::new())),
            Some((name, value)) => entries.push(CapabilityEntry::Property { name, value }),
            None => entries.push(CapabilityEntry::Property {
                name: line.trim().to_string(),
                value: String::new(),
            }),
        }
    }

    if let Some((name, fields)) = group {
        entries.push(CapabilityEntry::Group { name, fields });
    }
    entries
}

/// Category of a dump file name, e.g. `algorithms` for `Quicktest_algorithms.txt`.
pub fn dump_category(path: &Path, prefix: &str) -> Option<String> {
    let name = path.file_name()?.to_str()?;
    let category = name.strip_prefix(prefix)?.strip_suffix(".txt")?;
    Some(category.to_string())
}

fn category_rank(category: &str) -> usize {
    CATEGORY_ORDER
        .iter()
        .position(|c| *c == category)
        .unwrap_or(CATEGORY_ORDER.len())
}

/// Every `<prefix><category>.txt` dump in `detail_dir`, well-known categories first.
pub fn load_dumps(detail_dir: &Path, prefix: &str) -> std::io::Result<Vec<CapabilityDump>> {
    let mut paths: Vec<(String, PathBuf)> = std::fs::read_dir(detail_dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter_map(|p| dump_category(&p, prefix).map(|c| (c, p)))
        .collect();
    paths.sort_by(|a, b| {
        category_rank(&a.0)
            .cmp(&category_rank(&b.0))
            .then_with(|| a.0.cmp(&b.0))
    });

    let mut dumps = Vec::new();
    for (category, path) in paths {
        let text = std::fs::read_to_string(&path)?;
        dumps.push(CapabilityDump {
            category,
            entries: parse_dump(&text),
        });
    }
    Ok(dumps)
}

/// Parse a 32-bit register value, hex (`0x...`) or decimal.
fn parse_register(value: &str) -> Option<u32> {
    let value = value.trim();
    match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16).ok(),
        None => value.parse().ok(),
    }
}

/// Decode a register holding up to four ASCII characters; other values pass through.
pub fn decode_ascii_register(value: &str) -> String {
    let trimmed = value.trim().trim_matches('"');
    match parse_register(trimmed) {
        Some(raw) if trimmed.starts_with("0x") || trimmed.starts_with("0X") => raw
            .to_be_bytes()
            .iter()
            .filter(|b| b.is_ascii_graphic() || **b == b' ')
            .map(|b| *b as char)
            .collect::<String>()
            .trim()
            .to_string(),
        _ => trimmed.to_string(),
    }
}

/// `hi1.lo1.hi2.lo2` from the two firmware version registers.
pub fn decode_firmware(version_1: &str, version_2: &str) -> Option<String> {
    let v1 = parse_register(version_1)?;
    let v2 = parse_register(version_2)?;
    Some(format!(
        "{}.{}.{}.{}",
        v1 >> 16,
        v1 & 0xffff,
        v2 >> 16,
        v2 & 0xffff
    ))
}

/// Device identity from the fixed-properties dump.
pub fn identity_from_dump(dump: &CapabilityDump) -> Result<DeviceIdentity, ProbeError> {
    let value = |name: &str| -> Result<&str, ProbeError> {
        dump.get(name)
            .and_then(|e| e.value())
            .ok_or_else(|| ProbeError::IdentityIncomplete(name.to_string()))
    };

    let manufacturer = decode_ascii_register(value("TPM2_PT_MANUFACTURER")?);

    // vendor strings 2..4 are optional on some chips
    let vendor: String = (1..=4)
        .filter_map(|i| dump.get(&format!("TPM2_PT_VENDOR_STRING_{}", i)))
        .filter_map(|e| e.value())
        .map(decode_ascii_register)
        .collect();

    let fw1 = value("TPM2_PT_FIRMWARE_VERSION_1")?;
    let fw2 = value("TPM2_PT_FIRMWARE_VERSION_2")?;
    let firmware = decode_firmware(fw1, fw2)
        .ok_or_else(|| ProbeError::IdentityIncomplete("TPM2_PT_FIRMWARE_VERSION".to_string()))?;

    Ok(DeviceIdentity {
        manufacturer,
        vendor: vendor.trim().to_string(),
        firmware,
    })
}

/// Read the identity from `<detail_dir>/<prefix>properties-fixed.txt`.
pub fn read_identity(detail_dir: &Path, prefix: &str) -> Result<DeviceIdentity, ProbeError> {
    let path = detail_dir.join(format!("{}{}.txt", prefix, FIXED_PROPERTIES));
    let text = std::fs::read_to_string(&path)
        .map_err(|_| ProbeError::DumpMissing(path.display().to_string()))?;
    let dump = CapabilityDump {
        category: FIXED_PROPERTIES.to_string(),
        entries: parse_dump(&text),
    };
    identity_from_dump(&dump)
}
