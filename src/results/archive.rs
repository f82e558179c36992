//! Zip archive of a run directory.

use crate::error::ArchiveError;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

/// `<run_dir>.zip`, next to the run directory.
pub fn archive_path(run_dir: &Path) -> PathBuf {
    let mut name = run_dir
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".zip");
    run_dir.with_file_name(name)
}

fn collect_files(dir: &Path, files: &mut Vec<PathBuf>) -> io::Result<()> {
    let mut entries: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .collect();
    entries.sort();
    for path in entries {
        if path.is_dir() {
            files.push(path.clone());
            collect_files(&path, files)?;
        } else {
            files.push(path);
        }
    }
    Ok(())
}

/// Entry name of `path` inside the archive: relative, `/`-separated.
fn entry_name(root: &Path, path: &Path) -> Result<String, ArchiveError> {
    let relative = path
        .strip_prefix(root)
        .map_err(|_| ArchiveError::ForeignPath(path.display().to_string()))?;
    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Ok(parts.join("/"))
}

/// Zip every file under `run_dir` into `<run_dir>.zip` and return its path.
///
/// The archive is staged next to the run directory and renamed into place once
/// complete, so `<run_dir>.zip` never names a partial archive.
pub fn create_archive(run_dir: &Path) -> Result<PathBuf, ArchiveError> {
    let target = archive_path(run_dir);
    let mut files = Vec::new();
    collect_files(run_dir, &mut files)?;

    let parent = match target.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let staged = tempfile::NamedTempFile::new_in(parent)?;
    let mut zip = ZipWriter::new(BufWriter::new(staged.as_file()));
    let options = FileOptions::default().compression_method(CompressionMethod::Deflated);

    for path in &files {
        let name = entry_name(run_dir, path)?;
        if path.is_dir() {
            zip.add_directory(format!("{}/", name), options)?;
        } else {
            zip.start_file(name, options)?;
            let mut source = File::open(path)?;
            io::copy(&mut source, &mut zip)?;
        }
    }
    zip.finish()?.flush()?;
    drop(zip);
    staged.persist(&target).map_err(|e| e.error)?;

    log::info!(
        "[Archive] {} entries written to {}",
        files.len(),
        target.display()
    );
    Ok(target)
}
