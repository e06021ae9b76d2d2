use std::fs;
use std::path::{Path, PathBuf};

use crate::gap::*;

pub fn simplify_file_name(path: &Path) -> String {
    path.file_name()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}

#[derive(Eq, PartialEq, Debug, Clone, Copy)]
pub enum TextEncoding {
    Utf8,
    Latin1,
}

/// Decodes the content of a file: UTF-8 if it is valid, Latin-1 otherwise.
/// A UTF-8 byte order mark is removed.
pub fn decode_text(bytes: &[u8]) -> (String, TextEncoding) {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    match std::str::from_utf8(bytes) {
        Ok(s) => (s.to_string(), TextEncoding::Utf8),
        // Every byte is a valid Latin-1 code point.
        Err(_) => (
            bytes.iter().map(|b| *b as char).collect(),
            TextEncoding::Latin1,
        ),
    }
}

/// The `*.csv` files of a directory, sorted by name.
pub fn list_source_files(dir: &Path) -> GapResult<Vec<PathBuf>> {
    let entries = fs::read_dir(dir).context(ReadingSourceSnafu {
        path: dir.display().to_string(),
    })?;
    let mut res: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.extension()
                .map(|ext| ext.to_string_lossy().eq_ignore_ascii_case("csv"))
                .unwrap_or(false)
        })
        .collect();
    res.sort();
    Ok(res)
}

/// The subdirectories of `root` whose name designates a category, sorted by
/// name. Other entries are ignored.
pub fn discover_sources(root: &Path) -> GapResult<Vec<(Category, PathBuf)>> {
    let entries = fs::read_dir(root).context(ReadingSourceSnafu {
        path: root.display().to_string(),
    })?;
    let mut res: Vec<(Category, PathBuf)> = Vec::new();
    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        match Category::from_label(&simplify_file_name(&path)) {
            Some(c) => res.push((c, path)),
            None => debug!("discover_sources: ignoring {:?}", path),
        }
    }
    res.sort_by(|a, b| a.1.cmp(&b.1));
    Ok(res)
}
