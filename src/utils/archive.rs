//! Folder-to-ZIP archiving and extraction.
//!
//! Archives are plain DEFLATE ZIP containers. Entries are named by their
//! POSIX-style relative path and carry the source mtime; the returned
//! manifest records `(path, mtime millis)` in traversal order and is the
//! authoritative timestamp source on extraction, because the container's
//! time precision is coarser.
//!
//! All entry I/O streams through fixed-size buffers; file contents are
//! never held in memory whole.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, Timelike, Utc};
use tracing::{debug, info, warn};
use walkdir::WalkDir;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::core::protocol::manifest::ManifestEntry;
use crate::utils::time::{millis_to_system_time, now_millis, system_time_millis};

/// Compress `source` (a directory) into the ZIP file at `dest`.
///
/// Returns the manifest of archived files. Directories themselves produce
/// no entries, so an empty folder yields an archive with an empty manifest.
pub fn archive_folder(source: &Path, dest: &Path) -> Result<Vec<ManifestEntry>> {
    if !source.is_dir() {
        return Err(anyhow!(
            "source is not a directory: {}",
            source.display()
        ));
    }

    let mut writer = ZipWriter::new(File::create(dest)?);
    let mut manifest = Vec::new();

    for entry in WalkDir::new(source).sort_by_file_name() {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }

        let rel = entry.path().strip_prefix(source)?;
        let rel_name = posix_relative(rel);
        let meta = entry.metadata()?;
        let mod_time = meta
            .modified()
            .map(system_time_millis)
            .unwrap_or_else(|_| now_millis());

        let options = FileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .last_modified_time(zip_datetime(mod_time));
        writer.start_file(rel_name.as_str(), options)?;

        let mut src = File::open(entry.path())?;
        io::copy(&mut src, &mut writer)?;

        debug!(event = "archive_entry", path = %rel_name, "Archived file");
        manifest.push(ManifestEntry {
            path: rel_name,
            mod_time,
        });
    }

    writer.finish()?;
    info!(
        event = "archive_created",
        path = %dest.display(),
        files = manifest.len(),
        "Folder archived"
    );
    Ok(manifest)
}

/// Extract every entry of `archive_path` below `dest`, creating parent
/// directories as needed.
///
/// File mtimes are restored from `manifest` when the entry path matches,
/// otherwise from the archive entry itself; a failed restore is tolerated.
/// Entry names that escape `dest` (absolute, traversal) abort extraction.
pub fn extract_archive(
    archive_path: &Path,
    dest: &Path,
    manifest: &[ManifestEntry],
) -> Result<usize> {
    let mut archive = ZipArchive::new(File::open(archive_path)?)?;
    fs::create_dir_all(dest)?;

    let mut extracted = 0;
    for index in 0..archive.len() {
        let mut entry = archive.by_index(index)?;
        let name = entry.name().to_string();
        let out_path = dest.join(checked_entry_path(&name)?);

        if entry.is_dir() {
            fs::create_dir_all(&out_path)?;
            continue;
        }

        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut out = File::create(&out_path)?;
        io::copy(&mut entry, &mut out)?;

        let mod_time = manifest
            .iter()
            .find(|m| m.path == name)
            .map(|m| m.mod_time)
            .or_else(|| zip_datetime_millis(entry.last_modified()));
        if let Some(millis) = mod_time {
            if out.set_modified(millis_to_system_time(millis)).is_err() {
                warn!(event = "mtime_restore_failure", path = %out_path.display(), "Could not restore mtime");
            }
        }

        extracted += 1;
    }

    info!(
        event = "archive_extracted",
        path = %archive_path.display(),
        dest = %dest.display(),
        files = extracted,
        "Archive extracted"
    );
    Ok(extracted)
}

/// Join path components with `/` regardless of platform separators.
fn posix_relative(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// Validate an archive entry name and turn it into a safe relative path.
///
/// Rejects absolute paths, drive prefixes, `.`/`..` components, control
/// characters, and empty names.
fn checked_entry_path(name: &str) -> Result<PathBuf> {
    let name = name.replace('\\', "/");

    if name.starts_with('/') || name.contains(':') {
        return Err(anyhow!("absolute entry path not allowed: {name}"));
    }

    let components: Vec<&str> = name.split('/').filter(|s| !s.is_empty()).collect();
    if components.is_empty() {
        return Err(anyhow!("empty entry path"));
    }

    for component in &components {
        if *component == ".." || *component == "." {
            return Err(anyhow!("entry path traversal not allowed: {name}"));
        }
        if component.chars().any(|c| c.is_control()) {
            return Err(anyhow!("invalid characters in entry path: {name}"));
        }
    }

    Ok(components.iter().collect())
}

/// Epoch millis → ZIP (DOS) timestamp, clamped to the representable range.
fn zip_datetime(millis: u64) -> zip::DateTime {
    let dt: DateTime<Utc> =
        DateTime::from_timestamp_millis(millis as i64).unwrap_or_else(Utc::now);
    zip::DateTime::from_date_and_time(
        dt.year().clamp(1980, 2107) as u16,
        dt.month() as u8,
        dt.day() as u8,
        dt.hour() as u8,
        dt.minute() as u8,
        dt.second() as u8,
    )
    .unwrap_or_default()
}

/// ZIP (DOS) timestamp → epoch millis, if the stored date is valid.
fn zip_datetime_millis(dt: zip::DateTime) -> Option<u64> {
    let date = NaiveDate::from_ymd_opt(dt.year() as i32, dt.month() as u32, dt.day() as u32)?;
    let time =
        chrono::NaiveTime::from_hms_opt(dt.hour() as u32, dt.minute() as u32, dt.second() as u32)?;
    let millis = NaiveDateTime::new(date, time).and_utc().timestamp_millis();
    (millis >= 0).then_some(millis as u64)
}
