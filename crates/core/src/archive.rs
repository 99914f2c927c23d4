use std::collections::BTreeMap;
use std::io::{Cursor, Read};

use tracing::debug;

use crate::{Error, Result};

/// Path to text content, ordered by path so commit order is deterministic.
pub type Entries = BTreeMap<String, String>;

/// Ceiling on the total decompressed size of one archive.
pub const MAX_EXPANDED_BYTES: u64 = 256 * 1024 * 1024;

/// Decompresses a ZIP archive into its text files.
///
/// Directory entries are skipped. Every file must decode as UTF-8; the first
/// one that does not fails the whole extraction.
pub fn extract(bytes: &[u8]) -> Result<Entries> {
    extract_limited(bytes, MAX_EXPANDED_BYTES)
}

/// [`extract`] with an explicit budget for decompressed bytes, shared by all
/// entries. Declared entry sizes are not trusted.
pub fn extract_limited(bytes: &[u8], max_expanded: u64) -> Result<Entries> {
    if bytes.is_empty() {
        return Err(Error::EmptyArchive);
    }

    let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).map_err(|e| Error::CorruptArchive {
        message: e.to_string(),
    })?;

    let mut entries = Entries::new();
    let mut budget = max_expanded;
    for i in 0..archive.len() {
        let mut file = archive.by_index(i).map_err(|e| Error::CorruptArchive {
            message: format!("entry {i}: {e}"),
        })?;
        if file.is_dir() {
            continue;
        }

        let path = file.name().to_string();
        let mut buf = Vec::new();
        (&mut file)
            .take(budget.saturating_add(1))
            .read_to_end(&mut buf)
            .map_err(|e| Error::CorruptArchive {
                message: format!("{path}: {e}"),
            })?;
        let read = buf.len() as u64;
        if read > budget {
            return Err(Error::CorruptArchive {
                message: format!("{path}: expands past {max_expanded} bytes"),
            });
        }
        budget -= read;
        let text = String::from_utf8(buf).map_err(|_| Error::UndecodableEntry { path: path.clone() })?;
        entries.insert(path, text);
    }

    if entries.is_empty() {
        return Err(Error::NoEntries);
    }

    debug!(
        event = "archive.extracted",
        bytes = bytes.len() as u64,
        entries = entries.len() as u64,
        "archive.extracted"
    );
    Ok(entries)
}

#[cfg(test)]
pub(crate) mod tests {
    use std::io::Write;

    use zip::write::SimpleFileOptions;

    use super::*;

    pub(crate) fn build_zip(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut w = zip::ZipWriter::new(Cursor::new(Vec::new()));
        for (name, data) in files {
            if name.ends_with('/') {
                w.add_directory(name.trim_end_matches('/'), SimpleFileOptions::default())
                    .unwrap();
            } else {
                w.start_file(*name, SimpleFileOptions::default()).unwrap();
                w.write_all(data).unwrap();
            }
        }
        w.finish().unwrap().into_inner()
    }

    #[test]
    fn extracts_files_and_skips_directories() {
        let bytes = build_zip(&[
            ("project/", b""),
            ("project/a.txt", b"alpha"),
            ("project/src/b.rs", b"fn main() {}"),
        ]);
        let entries = extract(&bytes).unwrap();
        let keys: Vec<_> = entries.keys().cloned().collect();
        assert_eq!(keys, vec!["project/a.txt", "project/src/b.rs"]);
        assert_eq!(entries["project/a.txt"], "alpha");
    }

    #[test]
    fn extraction_is_repeatable() {
        let bytes = build_zip(&[("a.txt", b"1"), ("b.txt", b"2")]);
        assert_eq!(extract(&bytes).unwrap(), extract(&bytes).unwrap());
    }

    #[test]
    fn empty_input_is_rejected() {
        assert!(matches!(extract(&[]), Err(Error::EmptyArchive)));
    }

    #[test]
    fn garbage_is_corrupt() {
        assert!(matches!(
            extract(b"definitely not a zip file"),
            Err(Error::CorruptArchive { .. })
        ));
    }

    #[test]
    fn directories_only_has_no_entries() {
        let bytes = build_zip(&[("project/", b""), ("project/src/", b"")]);
        assert!(matches!(extract(&bytes), Err(Error::NoEntries)));
    }

    #[test]
    fn expansion_past_budget_is_corrupt() {
        let zeros = vec![0u8; 1 << 20];
        let bytes = build_zip(&[("big.txt", &zeros)]);
        assert!(bytes.len() < 64 * 1024);

        match extract_limited(&bytes, 64 * 1024) {
            Err(Error::CorruptArchive { message }) => {
                assert!(message.starts_with("big.txt"), "{message}")
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn budget_is_shared_across_entries() {
        let half = vec![b'a'; 600];
        let bytes = build_zip(&[("a.txt", &half), ("b.txt", &half)]);
        assert!(extract_limited(&bytes, 1200).is_ok());
        assert!(matches!(
            extract_limited(&bytes, 1000),
            Err(Error::CorruptArchive { .. })
        ));
    }

    #[test]
    fn binary_entry_fails_whole_extraction() {
        let bytes = build_zip(&[("ok.txt", b"fine"), ("logo.png", &[0x89, 0x50, 0xff, 0xfe])]);
        match extract(&bytes) {
            Err(Error::UndecodableEntry { path }) => assert_eq!(path, "logo.png"),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
