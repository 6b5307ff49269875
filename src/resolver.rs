//! Collision-free local output names
//!
//! `report.txt` → `report(1).txt` → `report(2).txt`, `notes` → `notes(1)`.
//! A candidate that already carries a counter (`report(4).txt`) continues from
//! that counter. Only the final path component is rewritten.

use std::path::{Path, PathBuf};

use crate::error::{Result, TransferError};

// Highest counter tried before giving up
pub const MAX_INDEX: u64 = 1_000_000;

/// A file name split into `stem`, optional existing counter and extension
#[derive(Debug, PartialEq, Eq)]
struct NameParts<'a> {
    stem: &'a str,
    index: Option<u64>,
    ext: Option<&'a str>,
}

fn split_name(name: &str) -> NameParts<'_> {
    // A leading dot marks a hidden file, not an extension
    let (base, ext) = match name.rfind('.') {
        Some(i) if i > 0 => (&name[..i], Some(&name[i + 1..])),
        _ => (name, None),
    };
    if let Some(inner) = base.strip_suffix(')') {
        if let Some(open) = inner.rfind('(') {
            let digits = &inner[open + 1..];
            if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) {
                if let Ok(index) = digits.parse::<u64>() {
                    return NameParts {
                        stem: &inner[..open],
                        index: Some(index),
                        ext,
                    };
                }
            }
        }
    }
    NameParts { stem: base, index: None, ext }
}

fn with_index(parts: &NameParts<'_>, index: u64) -> String {
    match parts.ext {
        Some(ext) => format!("{}({}).{}", parts.stem, index, ext),
        None => format!("{}({})", parts.stem, index),
    }
}

/// First path, starting from `candidate`, that does not exist on disk.
/// Returns `candidate` itself when it is free.
pub fn unique_name(candidate: &Path) -> Result<PathBuf> {
    if !candidate.exists() {
        return Ok(candidate.to_path_buf());
    }
    let name = match candidate.file_name() {
        Some(n) => n.to_string_lossy().into_owned(),
        None => {
            return Err(TransferError::NoFreeName {
                candidate: candidate.to_path_buf(),
            })
        }
    };
    let parts = split_name(&name);
    let start = parts.index.map_or(1, |i| i.saturating_add(1));
    for index in start..=MAX_INDEX.max(start) {
        let next = candidate.with_file_name(with_index(&parts, index));
        if !next.exists() {
            return Ok(next);
        }
    }
    Err(TransferError::NoFreeName {
        candidate: candidate.to_path_buf(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn touch(dir: &Path, name: &str) {
        fs::write(dir.join(name), b"x").unwrap();
    }

    #[test]
    fn free_candidate_is_unchanged() {
        let tmp = TempDir::new().unwrap();
        let p = tmp.path().join("report.txt");
        assert_eq!(unique_name(&p).unwrap(), p);
    }

    #[test]
    fn first_collision_inserts_counter_before_extension() {
        let tmp = TempDir::new().unwrap();
        touch(tmp.path(), "report.txt");
        assert_eq!(
            unique_name(&tmp.path().join("report.txt")).unwrap(),
            tmp.path().join("report(1).txt")
        );
    }

    #[test]
    fn counter_increments_past_existing() {
        let tmp = TempDir::new().unwrap();
        touch(tmp.path(), "report.txt");
        touch(tmp.path(), "report(1).txt");
        assert_eq!(
            unique_name(&tmp.path().join("report.txt")).unwrap(),
            tmp.path().join("report(2).txt")
        );
    }

    #[test]
    fn no_extension_appends_counter() {
        let tmp = TempDir::new().unwrap();
        touch(tmp.path(), "notes");
        assert_eq!(
            unique_name(&tmp.path().join("notes")).unwrap(),
            tmp.path().join("notes(1)")
        );
    }

    #[test]
    fn counted_candidate_continues_from_its_counter() {
        let tmp = TempDir::new().unwrap();
        touch(tmp.path(), "report(4).txt");
        assert_eq!(
            unique_name(&tmp.path().join("report(4).txt")).unwrap(),
            tmp.path().join("report(5).txt")
        );
    }

    #[test]
    fn only_last_extension_is_split() {
        let tmp = TempDir::new().unwrap();
        touch(tmp.path(), "archive.tar.gz");
        assert_eq!(
            unique_name(&tmp.path().join("archive.tar.gz")).unwrap(),
            tmp.path().join("archive.tar(1).gz")
        );
    }

    #[test]
    fn hidden_file_has_no_extension() {
        let tmp = TempDir::new().unwrap();
        touch(tmp.path(), ".bashrc");
        assert_eq!(
            unique_name(&tmp.path().join(".bashrc")).unwrap(),
            tmp.path().join(".bashrc(1)")
        );
    }

    #[test]
    fn never_returns_existing_and_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        for name in ["data.bin", "data(1).bin", "data(2).bin", "data(3).bin"] {
            touch(tmp.path(), name);
        }
        let cand = tmp.path().join("data.bin");
        let a = unique_name(&cand).unwrap();
        let b = unique_name(&cand).unwrap();
        assert_eq!(a, b);
        assert!(!a.exists());
        assert_eq!(a, tmp.path().join("data(4).bin"));
    }

    #[test]
    fn split_name_cases() {
        assert_eq!(
            split_name("report(12).txt"),
            NameParts { stem: "report", index: Some(12), ext: Some("txt") }
        );
        assert_eq!(
            split_name("a(b).txt"),
            NameParts { stem: "a(b)", index: None, ext: Some("txt") }
        );
        assert_eq!(
            split_name("notes(3)"),
            NameParts { stem: "notes", index: Some(3), ext: None }
        );
        assert_eq!(split_name("()"), NameParts { stem: "()", index: None, ext: None });
    }
}
