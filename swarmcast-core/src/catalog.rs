//! Local file catalog: recursive indexing, content hashing, chunk I/O.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

/// Fixed chunk size: the unit of transfer and buffering.
pub const CHUNK_SIZE: usize = 256 * 1024;

/// A shared file as advertised to peers. The catalog key is the content
/// hash, not the name; records with equal hash are interchangeable sources
/// for the same bytes regardless of local naming.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub name: String,
    pub size: u64,
    pub hash: String,
}

impl FileRecord {
    /// Number of chunks the file splits into at the given chunk size.
    pub fn total_chunks(&self, chunk_size: usize) -> u32 {
        self.size.div_ceil(chunk_size as u64) as u32
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("hash not in catalog: {0}")]
    NotFound(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

struct IndexedFile {
    record: FileRecord,
    path: PathBuf,
}

/// Content-addressed index of the files under a root folder.
pub struct FileCatalog {
    root: PathBuf,
    files: RwLock<HashMap<String, IndexedFile>>,
}

impl FileCatalog {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            files: RwLock::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Rebuild the catalog by walking the root folder recursively. Hidden
    /// files (dot-prefixed) are skipped. Returns the number of indexed files.
    pub fn scan(&self) -> std::io::Result<usize> {
        let mut indexed = HashMap::new();
        let mut pending = vec![self.root.clone()];
        while let Some(dir) = pending.pop() {
            for entry in fs::read_dir(&dir)? {
                let entry = entry?;
                let path = entry.path();
                let name = entry.file_name().to_string_lossy().into_owned();
                if name.starts_with('.') {
                    continue;
                }
                let kind = entry.file_type()?;
                if kind.is_dir() {
                    pending.push(path);
                } else if kind.is_file() {
                    match index_file(&path, &name) {
                        Ok(file) => {
                            debug!(name = %file.record.name, hash = %file.record.hash, "indexed");
                            indexed.insert(file.record.hash.clone(), file);
                        }
                        Err(e) => warn!(path = %path.display(), error = %e, "failed to index"),
                    }
                }
            }
        }
        let count = indexed.len();
        *self.files.write() = indexed;
        Ok(count)
    }

    pub fn list(&self) -> Vec<FileRecord> {
        self.files.read().values().map(|f| f.record.clone()).collect()
    }

    pub fn get(&self, hash: &str) -> Option<FileRecord> {
        self.files.read().get(hash).map(|f| f.record.clone())
    }

    /// Read one chunk of a shared file. Unknown hashes are an error; an
    /// index past the end of the file yields an empty buffer.
    pub fn read_chunk(&self, hash: &str, index: u32) -> Result<Vec<u8>, CatalogError> {
        let (path, size) = {
            let files = self.files.read();
            let file = files
                .get(hash)
                .ok_or_else(|| CatalogError::NotFound(hash.to_owned()))?;
            (file.path.clone(), file.record.size)
        };
        let offset = index as u64 * CHUNK_SIZE as u64;
        if offset >= size {
            return Ok(Vec::new());
        }
        let len = (CHUNK_SIZE as u64).min(size - offset) as usize;
        let mut buf = vec![0u8; len];
        let mut f = File::open(path)?;
        f.seek(SeekFrom::Start(offset))?;
        f.read_exact(&mut buf)?;
        Ok(buf)
    }
}

/// Write a chunk's bytes at its offset in the destination file, creating
/// the file if absent. Chunks of one download never overlap, so a single
/// writer per destination path needs no locking.
pub fn write_chunk(dest: &Path, index: u32, data: &[u8]) -> std::io::Result<()> {
    let mut f = OpenOptions::new().create(true).write(true).open(dest)?;
    f.seek(SeekFrom::Start(index as u64 * CHUNK_SIZE as u64))?;
    f.write_all(data)
}

/// SHA-256 of a file's contents as a lowercase hex digest.
pub fn hash_file(path: &Path) -> std::io::Result<String> {
    let mut hasher = Sha256::new();
    let mut f = File::open(path)?;
    let mut buf = [0u8; 8192];
    loop {
        let n = f.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

fn index_file(path: &Path, name: &str) -> std::io::Result<IndexedFile> {
    let size = fs::metadata(path)?.len();
    let hash = hash_file(path)?;
    Ok(IndexedFile {
        record: FileRecord {
            name: name.to_owned(),
            size,
            hash,
        },
        path: path.to_owned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog_with(files: &[(&str, &[u8])]) -> (tempfile::TempDir, FileCatalog) {
        let dir = tempfile::tempdir().unwrap();
        for (name, data) in files {
            fs::write(dir.path().join(name), data).unwrap();
        }
        let catalog = FileCatalog::new(dir.path());
        catalog.scan().unwrap();
        (dir, catalog)
    }

    #[test]
    fn total_chunks_ceil() {
        let record = FileRecord {
            name: "clip.mp4".into(),
            size: 600 * 1024,
            hash: "h".into(),
        };
        assert_eq!(record.total_chunks(CHUNK_SIZE), 3);
        let exact = FileRecord { size: 512 * 1024, ..record.clone() };
        assert_eq!(exact.total_chunks(CHUNK_SIZE), 2);
        let empty = FileRecord { size: 0, ..record };
        assert_eq!(empty.total_chunks(CHUNK_SIZE), 0);
    }

    #[test]
    fn scan_indexes_by_hash_and_skips_hidden() {
        let (_dir, catalog) = catalog_with(&[
            ("a.bin", b"hello"),
            ("b.bin", b"hello"),
            (".hidden", b"secret"),
        ]);
        // Duplicate contents collapse to one entry keyed by hash.
        assert_eq!(catalog.list().len(), 1);
        let record = &catalog.list()[0];
        assert_eq!(record.size, 5);
        assert_eq!(catalog.get(&record.hash).unwrap().hash, record.hash);
    }

    #[test]
    fn scan_walks_subdirectories() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/deep.bin"), b"nested").unwrap();
        let catalog = FileCatalog::new(dir.path());
        assert_eq!(catalog.scan().unwrap(), 1);
        assert_eq!(catalog.list()[0].name, "deep.bin");
    }

    #[test]
    fn read_chunk_bounds() {
        let data: Vec<u8> = (0..=255u8).cycle().take(CHUNK_SIZE + 100).collect();
        let (_dir, catalog) = catalog_with(&[("big.bin", &data)]);
        let hash = catalog.list()[0].hash.clone();

        let first = catalog.read_chunk(&hash, 0).unwrap();
        assert_eq!(first.len(), CHUNK_SIZE);
        assert_eq!(&first[..], &data[..CHUNK_SIZE]);

        let last = catalog.read_chunk(&hash, 1).unwrap();
        assert_eq!(&last[..], &data[CHUNK_SIZE..]);

        // Past EOF yields empty, not an error.
        assert!(catalog.read_chunk(&hash, 2).unwrap().is_empty());
    }

    #[test]
    fn read_chunk_unknown_hash() {
        let (_dir, catalog) = catalog_with(&[("a.bin", b"x")]);
        assert!(matches!(
            catalog.read_chunk("deadbeef", 0),
            Err(CatalogError::NotFound(_))
        ));
    }

    #[test]
    fn write_chunk_at_offset() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.bin");
        write_chunk(&dest, 1, b"second").unwrap();
        write_chunk(&dest, 0, b"first").unwrap();
        let written = fs::read(&dest).unwrap();
        assert_eq!(&written[..5], b"first");
        assert_eq!(&written[CHUNK_SIZE..], b"second");
    }

    #[test]
    fn hash_matches_contents() {
        let (_dir, catalog) = catalog_with(&[("a.bin", b"hello")]);
        let record = &catalog.list()[0];
        // SHA-256("hello")
        assert_eq!(
            record.hash,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }
}
