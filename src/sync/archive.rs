//! Container expansion.

use std::io::{Cursor, Read};

/// Largest buffer reserved up front from an entry's declared size. The
/// header is untrusted; bigger entries grow the buffer as they are read.
const MAX_PREALLOCATION: u64 = 64 << 20;

/// One readable entry of a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub name: String,
    pub bytes: Vec<u8>,
}

/// An entry whose content could not be read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryError {
    pub name: String,
    pub reason: String,
}

/// Expand a zip container, keeping entries whose name ends with `inner_suffix`
/// (ASCII case-insensitive).
///
/// The outer `Err` means the container itself is unreadable. Entry-level
/// failures are returned in place so one bad entry never hides the others.
/// Entry names are reduced to their final path component.
pub fn expand(
    bytes: &[u8],
    inner_suffix: &str,
) -> Result<Vec<Result<ArchiveEntry, EntryError>>, String> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).map_err(|e| e.to_string())?;
    let suffix = inner_suffix.to_ascii_lowercase();
    let mut entries = Vec::new();

    for index in 0..archive.len() {
        let mut file = match archive.by_index(index) {
            Ok(file) => file,
            Err(e) => {
                entries.push(Err(EntryError {
                    name: format!("#{}", index),
                    reason: e.to_string(),
                }));
                continue;
            }
        };
        if file.is_dir() {
            continue;
        }
        let name = file
            .name()
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .to_string();
        if name.is_empty() || !name.to_ascii_lowercase().ends_with(&suffix) {
            continue;
        }

        let mut content = Vec::with_capacity(capacity_hint(file.size()));
        match file.read_to_end(&mut content) {
            Ok(_) => entries.push(Ok(ArchiveEntry {
                name,
                bytes: content,
            })),
            Err(e) => entries.push(Err(EntryError {
                name,
                reason: e.to_string(),
            })),
        }
    }

    Ok(entries)
}

fn capacity_hint(declared: u64) -> usize {
    usize::try_from(declared.min(MAX_PREALLOCATION)).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{corrupt_entry, zip_bytes};

    #[test]
    fn test_expand_filters_by_suffix() {
        let bytes = zip_bytes(&[
            ("ValeursFoncieres-2024.txt", "a|b|c"),
            ("notice.pdf", "%PDF"),
            ("nested/extra.TXT", "x"),
        ]);

        let entries = expand(&bytes, ".txt").unwrap();
        let names: Vec<String> = entries
            .into_iter()
            .map(|e| e.unwrap().name)
            .collect();

        assert_eq!(names, vec!["ValeursFoncieres-2024.txt", "extra.TXT"]);
    }

    #[test]
    fn test_unreadable_container() {
        assert!(expand(b"definitely not a zip", ".txt").is_err());
    }

    #[test]
    fn test_corrupt_entry_does_not_hide_others() {
        let bytes = corrupt_entry(
            zip_bytes(&[("good.txt", "fine"), ("bad.txt", "CORRUPT-ME-PLEASE")]),
            "CORRUPT-ME-PLEASE",
        );

        let entries = expand(&bytes, ".txt").unwrap();

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].as_ref().unwrap().bytes, b"fine".to_vec());
        assert_eq!(entries[1].as_ref().unwrap_err().name, "bad.txt");
    }

    #[test]
    fn test_capacity_hint_ignores_oversized_headers() {
        assert_eq!(capacity_hint(0), 0);
        assert_eq!(capacity_hint(1024), 1024);
        assert_eq!(capacity_hint(u64::from(u32::MAX)), 64 << 20);
        assert_eq!(capacity_hint(u64::MAX), 64 << 20);
    }
}
