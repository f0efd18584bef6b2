use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use walkdir::WalkDir;

/// Create the parent directory of `path` if it is missing
pub fn ensure_parent_dir(path: &Path) -> io::Result<()> {
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => fs::create_dir_all(dir),
        _ => Ok(()),
    }
}

/// `<source>.backup_<YYYYmmdd_HHMMSS>` next to the source file
pub fn backup_path(source: &Path, at: DateTime<Local>) -> PathBuf {
    let mut name = source.as_os_str().to_os_string();
    name.push(format!(".backup_{}", at.format("%Y%m%d_%H%M%S")));
    PathBuf::from(name)
}

/// Expand bulk migration inputs into a sorted, de-duplicated list of JSON files.
///
/// Each input may be a file, a directory (scanned recursively for `*.json`),
/// or a glob pattern.
pub fn collect_json_files(inputs: &[String]) -> io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();

    for input in inputs {
        let path = Path::new(input);
        if path.is_dir() {
            for entry in WalkDir::new(path).into_iter().filter_map(|e| e.ok()) {
                if entry.file_type().is_file() && is_json(entry.path()) {
                    files.push(entry.into_path());
                }
            }
        } else if path.is_file() {
            files.push(path.to_path_buf());
        } else {
            let matches = glob::glob(input)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
            files.extend(matches.filter_map(|m| m.ok()).filter(|p| p.is_file()));
        }
    }

    files.sort();
    files.dedup();
    Ok(files)
}

fn is_json(path: &Path) -> bool {
    path.extension().map(|e| e == "json").unwrap_or(false)
}
