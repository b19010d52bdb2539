use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::Path;

/// Checksum of one snapshot directory: a crc32 per file plus a combined value that
/// folds in each file's NAME as well as its content crc. Renaming a file changes the
/// combined value; the order files were written in does not, because the combined
/// value is accumulated in sorted-name order.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotChecksum {
    per_file: BTreeMap<String, u32>,
    combined: u64,
}

impl SnapshotChecksum {
    pub fn combined(&self) -> u64 {
        self.combined
    }

    pub fn file_count(&self) -> usize {
        self.per_file.len()
    }

    pub fn file_checksum(&self, name: &str) -> Option<u32> {
        self.per_file.get(name).copied()
    }
}

/// crc32 of a byte slice; used for chunk content validation.
pub fn content_checksum(content: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(content);
    hasher.finalize()
}

fn file_checksum(path: &Path) -> io::Result<u32> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = crc32fast::Hasher::new();
    let mut buf = [0u8; 8 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize())
}

fn combine(per_file: &BTreeMap<String, u32>) -> u64 {
    // BTreeMap iteration is sorted by name, which is what makes the combined value
    // independent of write order.
    let mut hasher = crc32fast::Hasher::new();
    for (name, crc) in per_file {
        hasher.update(name.as_bytes());
        hasher.update(&crc.to_be_bytes());
    }
    hasher.finalize() as u64
}

/// Checksum every regular file directly inside `dir`.
pub fn checksum_directory(dir: &Path) -> io::Result<SnapshotChecksum> {
    let mut per_file = BTreeMap::new();
    for dir_entry in fs::read_dir(dir)? {
        let dir_entry = dir_entry?;
        if !dir_entry.file_type()?.is_file() {
            continue;
        }
        let name = dir_entry.file_name().to_string_lossy().into_owned();
        per_file.insert(name, file_checksum(&dir_entry.path())?);
    }

    let combined = combine(&per_file);
    Ok(SnapshotChecksum { per_file, combined })
}

/// Build the checksum from already-known per-file values, e.g. the chunk checksums
/// of a received snapshot.
pub fn from_file_checksums(files: impl IntoIterator<Item = (String, u32)>) -> SnapshotChecksum {
    let per_file: BTreeMap<String, u32> = files.into_iter().collect();
    let combined = combine(&per_file);
    SnapshotChecksum { per_file, combined }
}

/// Write the checksum file. SFV-style text: `;`-prefixed comment lines carry the
/// combined value, the file count and the snapshot directory, then one
/// `<name> <crc32 hex>` line per file in sorted-name order. Human-inspectable and
/// diffable.
pub fn write_checksum_file(
    path: &Path,
    checksum: &SnapshotChecksum,
    snapshot_directory: Option<&Path>,
) -> io::Result<()> {
    let mut out = String::new();
    out.push_str("; snapshot checksum file\n");
    out.push_str(&format!("; combined value = {:016x}\n", checksum.combined));
    out.push_str(&format!("; file count = {}\n", checksum.per_file.len()));
    if let Some(dir) = snapshot_directory {
        out.push_str(&format!("; snapshot directory = {}\n", dir.display()));
    }
    for (name, crc) in &checksum.per_file {
        out.push_str(&format!("{}   {:08x}\n", name, crc));
    }

    let mut file = File::create(path)?;
    file.write_all(out.as_bytes())?;
    file.sync_all()
}

/// The combined value as stored on disk. The legacy binary format carries no
/// per-file breakdown.
#[derive(Debug, PartialEq)]
pub struct StoredChecksum {
    pub combined: u64,
    pub per_file: Option<BTreeMap<String, u32>>,
}

/// Read a checksum file in either format: the SFV-style text format, or the legacy
/// raw format of exactly 8 big-endian bytes holding the combined value.
pub fn read_checksum_file(path: &Path) -> io::Result<StoredChecksum> {
    let raw = fs::read(path)?;

    if raw.first() == Some(&b';') {
        return parse_sfv(&raw);
    }

    if raw.len() == 8 {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&raw);
        return Ok(StoredChecksum {
            combined: u64::from_be_bytes(bytes),
            per_file: None,
        });
    }

    Err(io::Error::new(
        io::ErrorKind::InvalidData,
        format!("unrecognized checksum file format: {}", path.display()),
    ))
}

fn parse_sfv(raw: &[u8]) -> io::Result<StoredChecksum> {
    let invalid = |what: &str| io::Error::new(io::ErrorKind::InvalidData, format!("bad checksum file: {}", what));

    let mut combined = None;
    let mut per_file = BTreeMap::new();

    for line in BufReader::new(raw).lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(comment) = line.strip_prefix(';') {
            let comment = comment.trim();
            if let Some(value) = comment.strip_prefix("combined value =") {
                let parsed =
                    u64::from_str_radix(value.trim(), 16).map_err(|_| invalid("combined value not hex"))?;
                combined = Some(parsed);
            }
            // Other comments (file count, snapshot directory) are informational.
            continue;
        }

        let mut parts = line.split_whitespace();
        let name = parts.next().ok_or_else(|| invalid("missing file name"))?;
        let crc_hex = parts.next().ok_or_else(|| invalid("missing file crc"))?;
        let crc = u32::from_str_radix(crc_hex, 16).map_err(|_| invalid("file crc not hex"))?;
        per_file.insert(name.to_string(), crc);
    }

    Ok(StoredChecksum {
        combined: combined.ok_or_else(|| invalid("no combined value"))?,
        per_file: Some(per_file),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_file(dir: &Path, name: &str, content: &[u8]) {
        fs::write(dir.join(name), content).unwrap();
    }

    #[test]
    fn combined_value_is_independent_of_write_order() {
        let dir_a = tempfile::tempdir().unwrap();
        write_file(dir_a.path(), "file1", b"a");
        write_file(dir_a.path(), "file2", b"b");

        let dir_b = tempfile::tempdir().unwrap();
        write_file(dir_b.path(), "file2", b"b");
        write_file(dir_b.path(), "file1", b"a");

        let checksum_a = checksum_directory(dir_a.path()).unwrap();
        let checksum_b = checksum_directory(dir_b.path()).unwrap();
        assert_eq!(checksum_a.combined(), checksum_b.combined());
    }

    #[test]
    fn renaming_a_file_changes_the_combined_value() {
        let dir_a = tempfile::tempdir().unwrap();
        write_file(dir_a.path(), "file1", b"a");

        let dir_b = tempfile::tempdir().unwrap();
        write_file(dir_b.path(), "renamed", b"a");

        let checksum_a = checksum_directory(dir_a.path()).unwrap();
        let checksum_b = checksum_directory(dir_b.path()).unwrap();
        assert_ne!(checksum_a.combined(), checksum_b.combined());
    }

    #[test]
    fn checksum_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "file1", b"hello");
        write_file(dir.path(), "file2", b"world");
        let checksum = checksum_directory(dir.path()).unwrap();

        let checksum_path = dir.path().join("snapshot.checksum");
        write_checksum_file(&checksum_path, &checksum, Some(dir.path())).unwrap();

        let stored = read_checksum_file(&checksum_path).unwrap();
        assert_eq!(stored.combined, checksum.combined());
        let per_file = stored.per_file.unwrap();
        assert_eq!(per_file.len(), 2);
        assert_eq!(per_file.get("file1").copied(), checksum.file_checksum("file1"));
    }

    #[test]
    fn legacy_binary_checksum_file_is_readable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("old.checksum");
        fs::write(&path, 0xDEAD_BEEF_u64.to_be_bytes()).unwrap();

        let stored = read_checksum_file(&path).unwrap();
        assert_eq!(stored.combined, 0xDEAD_BEEF);
        assert_eq!(stored.per_file, None);
    }

    #[test]
    fn unrecognized_checksum_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.checksum");
        fs::write(&path, b"not a checksum").unwrap();

        assert!(read_checksum_file(&path).is_err());
    }

    #[test]
    fn from_file_checksums_matches_directory_checksum() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "file1", b"a");
        write_file(dir.path(), "file2", b"bb");
        let from_disk = checksum_directory(dir.path()).unwrap();

        let from_values = from_file_checksums(vec![
            ("file1".to_string(), content_checksum(b"a")),
            ("file2".to_string(), content_checksum(b"bb")),
        ]);

        assert_eq!(from_disk, from_values);
    }
}
