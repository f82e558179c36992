//! RSA private-exponent recovery for key-generation records.
//!
//! The key-generation benchmark records `n`, `e` and one prime `p` per key.
//! `q = n / p`, `phi = (p-1)(q-1)` and `d = e^-1 mod phi` follow. Every derived
//! pair must survive an encrypt/decrypt round trip before it is written; rows that
//! fail parsing or verification are reported and left untouched.

use crate::error::RecoveryError;
use num_bigint::{BigInt, BigUint, Sign};
use num_traits::{One, Zero};
use std::fmt;
use std::path::{Path, PathBuf};

/// Plaintext used for the round-trip check (reduced mod n).
const TEST_MESSAGE: u64 = 0x5EED_CAFE;

/// Derived key material for one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveredKey {
    pub q: BigUint,
    pub d: BigUint,
}

/// Why a row was not augmented.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowFailure {
    /// A field is missing or not hexadecimal
    Unparseable(String),
    /// `p` does not divide `n`, or is trivial
    NotAFactor,
    /// `e` has no inverse modulo phi
    NoInverse,
    /// `(m^e)^d mod n != m`
    VerificationFailed,
}

impl fmt::Display for RowFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RowFailure::Unparseable(field) => write!(f, "field '{}' is not a hex integer", field),
            RowFailure::NotAFactor => f.write_str("p is not a non-trivial factor of n"),
            RowFailure::NoInverse => f.write_str("e is not invertible modulo phi"),
            RowFailure::VerificationFailed => f.write_str("round-trip verification failed"),
        }
    }
}

/// One reported row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowReport {
    pub row: usize,
    pub id: String,
    pub failure: RowFailure,
}

/// Outcome of processing one key file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub file: PathBuf,
    pub recovered: usize,
    /// Rows that already carried `q` and `d`
    pub already_recovered: usize,
    pub failures: Vec<RowReport>,
}

/// Parse a hex field, accepting an optional `0x` prefix.
pub fn parse_hex(field: &str) -> Option<BigUint> {
    let trimmed = field.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    if digits.is_empty() {
        return None;
    }
    BigUint::parse_bytes(digits.as_bytes(), 16)
}

/// Modular inverse via the extended Euclidean algorithm.
pub fn mod_inverse(a: &BigUint, modulus: &BigUint) -> Option<BigUint> {
    if modulus.is_zero() {
        return None;
    }
    let m = BigInt::from_biguint(Sign::Plus, modulus.clone());
    let (mut old_r, mut r) = (BigInt::from_biguint(Sign::Plus, a % modulus), m.clone());
    let (mut old_s, mut s) = (BigInt::one(), BigInt::zero());

    while !r.is_zero() {
        let quotient = &old_r / &r;
        let next_r = &old_r - &quotient * &r;
        old_r = std::mem::replace(&mut r, next_r);
        let next_s = &old_s - &quotient * &s;
        old_s = std::mem::replace(&mut s, next_s);
    }

    if !old_r.is_one() {
        return None;
    }
    let normalized = ((old_s % &m) + &m) % &m;
    normalized.to_biguint()
}

/// Recover `q` and `d` from `(n, e, p)` and verify them.
pub fn recover(n: &BigUint, e: &BigUint, p: &BigUint) -> Result<RecoveredKey, RowFailure> {
    let one = BigUint::one();
    if p <= &one || p >= n || !(n % p).is_zero() {
        return Err(RowFailure::NotAFactor);
    }
    let q = n / p;
    let phi = (p - &one) * (&q - &one);
    let d = mod_inverse(e, &phi).ok_or(RowFailure::NoInverse)?;

    if !verify(n, e, &d) {
        return Err(RowFailure::VerificationFailed);
    }
    Ok(RecoveredKey { q, d })
}

/// Encrypt the fixed test message with `e`, decrypt with `d`, compare.
pub fn verify(n: &BigUint, e: &BigUint, d: &BigUint) -> bool {
    let m = BigUint::from(TEST_MESSAGE) % n;
    let c = m.modpow(e, n);
    c.modpow(d, n) == m
}

fn format_hex(value: &BigUint, uppercase: bool) -> String {
    if uppercase {
        format!("{:X}", value)
    } else {
        format!("{:x}", value)
    }
}

/// File name prefix of the key-generation detail files.
pub const KEYGEN_PREFIX: &str = "Keygen_";

/// Whether a `<prefix>RSA_<bits>_keys.csv` name.
pub fn is_key_file(path: &Path, prefix: &str) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .and_then(|name| name.strip_prefix(prefix))
        .map_or(false, |rest| rest.starts_with("RSA_") && rest.ends_with("_keys.csv"))
}

/// Every key file below `dir`, sorted.
pub fn find_key_files(dir: &Path, prefix: &str) -> std::io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    fn walk(dir: &Path, prefix: &str, files: &mut Vec<PathBuf>) -> std::io::Result<()> {
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_dir() {
                walk(&path, prefix, files)?;
            } else if is_key_file(&path, prefix) {
                files.push(path);
            }
        }
        Ok(())
    }
    if dir.is_dir() {
        walk(dir, prefix, &mut files)?;
    }
    files.sort();
    Ok(files)
}

fn text(field: &[u8]) -> Option<&str> {
    std::str::from_utf8(field).ok().map(str::trim)
}

/// Augment one key file with `q` and `d`.
///
/// Fields are handled as raw bytes: a row that is not valid UTF-8 is reported
/// and written back unchanged. The new content replaces the file by rename.
pub fn recover_file(path: &Path) -> Result<RecoveryReport, RecoveryError> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b';')
        .flexible(true)
        .from_path(path)?;

    let mut headers: Vec<Vec<u8>> = reader.byte_headers()?.iter().map(|h| h.to_vec()).collect();
    let column = |headers: &[Vec<u8>], name: &str| {
        headers.iter().position(|h| text(h) == Some(name))
    };

    let n_col = column(&headers, "n").ok_or_else(|| RecoveryError::MissingColumn("n".into()))?;
    let e_col = column(&headers, "e").ok_or_else(|| RecoveryError::MissingColumn("e".into()))?;
    let p_col = column(&headers, "p").ok_or_else(|| RecoveryError::MissingColumn("p".into()))?;
    let id_col = column(&headers, "id");
    let q_col = match column(&headers, "q") {
        Some(idx) => idx,
        None => {
            headers.push(b"q".to_vec());
            headers.len() - 1
        }
    };
    let d_col = match column(&headers, "d") {
        Some(idx) => idx,
        None => {
            headers.push(b"d".to_vec());
            headers.len() - 1
        }
    };

    let mut report = RecoveryReport {
        file: path.to_path_buf(),
        ..RecoveryReport::default()
    };
    let mut rows: Vec<Vec<Vec<u8>>> = Vec::new();

    for (index, record) in reader.byte_records().enumerate() {
        let mut row: Vec<Vec<u8>> = record?.iter().map(|f| f.to_vec()).collect();
        let row_number = index + 1;
        let id = id_col
            .and_then(|c| row.get(c))
            .map(|v| String::from_utf8_lossy(v).into_owned())
            .unwrap_or_else(|| row_number.to_string());

        let has = |row: &[Vec<u8>], idx: usize| {
            row.get(idx).map_or(false, |v| !v.iter().all(u8::is_ascii_whitespace))
        };
        if has(&row, q_col) && has(&row, d_col) {
            report.already_recovered += 1;
            rows.push(row);
            continue;
        }

        let field = |name: &str, idx: usize| -> Result<BigUint, RowFailure> {
            row.get(idx)
                .and_then(|v| text(v))
                .and_then(parse_hex)
                .ok_or_else(|| RowFailure::Unparseable(name.to_string()))
        };
        let parsed = field("n", n_col).and_then(|n| {
            let e = field("e", e_col)?;
            let p = field("p", p_col)?;
            Ok((n, e, p))
        });

        match parsed.and_then(|(n, e, p)| recover(&n, &e, &p)) {
            Ok(key) => {
                let uppercase = row[n_col].iter().any(|c| c.is_ascii_uppercase() && *c != b'X');
                if row.len() < headers.len() {
                    row.resize(headers.len(), Vec::new());
                }
                row[q_col] = format_hex(&key.q, uppercase).into_bytes();
                row[d_col] = format_hex(&key.d, uppercase).into_bytes();
                report.recovered += 1;
            }
            Err(failure) => {
                log::warn!(
                    "[Keys] {} row {} (id {}): {}",
                    path.display(),
                    row_number,
                    id,
                    failure
                );
                report.failures.push(RowReport {
                    row: row_number,
                    id,
                    failure,
                });
            }
        }
        rows.push(row);
    }
    drop(reader);

    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let staged = tempfile::NamedTempFile::new_in(parent)?;
    {
        let mut writer = csv::WriterBuilder::new()
            .delimiter(b';')
            .flexible(true)
            .from_writer(staged.as_file());
        writer.write_record(&headers)?;
        for row in &rows {
            writer.write_record(row)?;
        }
        writer.flush()?;
    }
    staged.persist(path).map_err(|e| RecoveryError::Io(e.error))?;

    log::info!(
        "[Keys] {}: {} recovered, {} already present, {} failed",
        path.display(),
        report.recovered,
        report.already_recovered,
        report.failures.len()
    );
    Ok(report)
}
