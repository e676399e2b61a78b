//! Small filesystem helpers shared by the sender and receiver paths.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

/// Converts bytes to a human-readable size.
pub fn format_file_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// Read `length` bytes at `offset` from an open file, shortened at EOF.
///
/// The handle's cursor position is not restored; callers seek per chunk.
pub fn read_file_chunk(
    file: &mut File,
    total_size: u64,
    offset: u64,
    length: u32,
) -> std::io::Result<Vec<u8>> {
    if offset >= total_size {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("offset {offset} beyond end of file ({total_size} bytes)"),
        ));
    }

    let actual = (length as u64).min(total_size - offset) as usize;
    file.seek(SeekFrom::Start(offset))?;
    let mut buffer = vec![0u8; actual];
    file.read_exact(&mut buffer)?;
    Ok(buffer)
}

/// Return `path` unchanged if free, otherwise the first free sibling named
/// `stem_1.ext`, `stem_2.ext`, … (`name_1`, `name_2`, … when there is no
/// extension, which also covers directories).
pub fn unique_path(path: PathBuf) -> PathBuf {
    if !path.exists() {
        return path;
    }

    let parent = path.parent().map(Path::to_path_buf).unwrap_or_default();
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let (stem, extension) = match name.rfind('.') {
        Some(dot) if dot > 0 => (&name[..dot], &name[dot..]),
        _ => (name.as_str(), ""),
    };

    let mut counter = 1;
    loop {
        let candidate = parent.join(format!("{stem}_{counter}{extension}"));
        if !candidate.exists() {
            return candidate;
        }
        counter += 1;
    }
}
