//! Local catalog (work folder): files indexed by content hash, served block by block.
//!
//! Lock order is entries -> cache; the two locks are never held in the opposite nesting.
//! A file's block map is built from disk on first request and kept in a bounded
//! [`BlockCache`]; the cache lock is held during the build so the same file is never
//! loaded twice concurrently.

use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{Local, NaiveDateTime};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::block::{split_into_blocks, FileBlock};
use crate::cache::{BlockCache, BlockMap};
use crate::config::Config;
use crate::integrity;

/// `yyyyMMdd_HHmmss`, inserted into names of downloaded files.
pub const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("not a directory: {}", .0.display())]
    NotADirectory(PathBuf),
    #[error("invalid file name: {0:?}")]
    InvalidName(String),
    #[error("i/o error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

fn io_error(path: &Path) -> impl Fn(io::Error) -> CatalogError + '_ {
    move |source| CatalogError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Catalog entry for one local file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMetadata {
    pub file_name: String,
    pub file_size: u64,
    pub content_hash: String,
    pub path: PathBuf,
    pub modified: SystemTime,
}

impl FileMetadata {
    /// Stat and hash the file at `path`.
    pub fn from_path(path: &Path) -> Result<Self, CatalogError> {
        let meta = fs::metadata(path).map_err(io_error(path))?;
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| CatalogError::InvalidName(path.display().to_string()))?
            .to_owned();
        let content_hash = integrity::hash_file(path).map_err(io_error(path))?;
        Ok(Self {
            file_name,
            file_size: meta.len(),
            content_hash,
            path: path.to_path_buf(),
            modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
        })
    }

    /// Newer modification time wins; equal times fall back to the larger name.
    fn supersedes(&self, other: &FileMetadata) -> bool {
        (self.modified, &self.file_name) > (other.modified, &other.file_name)
    }
}

pub struct WorkFolder {
    root: PathBuf,
    block_size: u64,
    entries: Mutex<HashMap<String, FileMetadata>>,
    cache: Mutex<BlockCache>,
}

impl WorkFolder {
    /// Open `root` and index its files. Fails if `root` is not a directory.
    pub fn open(root: impl Into<PathBuf>, config: &Config) -> Result<Self, CatalogError> {
        let folder = Self {
            root: root.into(),
            block_size: config.block_size,
            entries: Mutex::new(HashMap::new()),
            cache: Mutex::new(BlockCache::new(config.block_cache_files)),
        };
        folder.refresh()?;
        Ok(folder)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    /// Rescan the folder's direct files and rebuild the index. Returns the number of entries.
    pub fn refresh(&self) -> Result<usize, CatalogError> {
        let index = scan(&self.root)?;
        let live: HashSet<String> = index.keys().cloned().collect();
        let count = index.len();
        *self.entries.lock() = index;
        self.cache.lock().retain(|h| live.contains(h));
        debug!(folder = %self.root.display(), files = count, "catalog refreshed");
        Ok(count)
    }

    /// All entries, sorted by file name.
    pub fn entries(&self) -> Vec<FileMetadata> {
        let mut out: Vec<FileMetadata> = self.entries.lock().values().cloned().collect();
        out.sort_by(|a, b| a.file_name.cmp(&b.file_name));
        out
    }

    pub fn get(&self, content_hash: &str) -> Option<FileMetadata> {
        self.entries.lock().get(content_hash).cloned()
    }

    /// Files whose name contains `word`, ignoring case.
    pub fn search_by_keyword(&self, word: &str) -> Vec<FileMetadata> {
        let needle = word.to_lowercase();
        let mut out: Vec<FileMetadata> = self
            .entries
            .lock()
            .values()
            .filter(|m| m.file_name.to_lowercase().contains(&needle))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.file_name.cmp(&b.file_name));
        out
    }

    /// The block at `offset` of the file with `content_hash`, or `None` if the hash is unknown,
    /// the offset is not a block boundary, or the file cannot be read.
    pub fn get_block(&self, content_hash: &str, offset: u64) -> Option<FileBlock> {
        let Some(meta) = self.get(content_hash) else {
            warn!(hash = content_hash, "hash not found");
            return None;
        };
        let mut cache = self.cache.lock();
        if let Some(blocks) = cache.get(content_hash) {
            return blocks.get(&offset).cloned();
        }
        match load_blocks(&meta.path, self.block_size) {
            Ok(blocks) => {
                debug!(file = %meta.file_name, blocks = blocks.len(), "block map cached");
                cache
                    .insert(content_hash.to_owned(), blocks)
                    .get(&offset)
                    .cloned()
            }
            Err(e) => {
                warn!(file = %meta.path.display(), error = %e, "failed to load file");
                None
            }
        }
    }

    /// Where a download of `file_name` is saved: inside the folder, with a timestamp
    /// inserted before the extension. Only the last path component of `file_name` is used.
    pub fn timestamped_path(&self, file_name: &str) -> Result<PathBuf, CatalogError> {
        let name = Path::new(file_name)
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| CatalogError::InvalidName(file_name.to_owned()))?;
        Ok(self
            .root
            .join(timestamped_name(name, &Local::now().naive_local())))
    }

    /// Write `blocks` in order to a new file at `path`, then index it. An existing file is
    /// never overwritten: the name gets a `_1`, `_2`, ... suffix instead, and the returned
    /// metadata carries the path actually written. A failed write removes the partial file.
    pub fn write_and_index(&self, path: &Path, blocks: &[Vec<u8>]) -> Result<FileMetadata, CatalogError> {
        let (path, file) = create_unique(path).map_err(io_error(path))?;
        if let Err(e) = write_blocks(file, blocks) {
            let _ = fs::remove_file(&path);
            return Err(io_error(&path)(e));
        }
        let meta = FileMetadata::from_path(&path)?;
        self.entries
            .lock()
            .insert(meta.content_hash.clone(), meta.clone());
        info!(path = %path.display(), bytes = meta.file_size, "file written");
        Ok(meta)
    }
}

/// `report.pdf` -> `report_<stamp>.pdf`; names without an extension get the stamp appended.
pub fn timestamped_name(file_name: &str, at: &NaiveDateTime) -> String {
    with_suffix(file_name, &at.format(TIMESTAMP_FORMAT).to_string())
}

fn with_suffix(file_name: &str, suffix: &str) -> String {
    match file_name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{stem}_{suffix}.{ext}"),
        _ => format!("{file_name}_{suffix}"),
    }
}

/// Attempts at a free name before giving up.
const MAX_NAME_SUFFIX: usize = 1000;

/// Create `path`, or the first free `name_<n>.ext` beside it.
fn create_unique(path: &Path) -> io::Result<(PathBuf, File)> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "invalid file name"))?;
    for n in 0..MAX_NAME_SUFFIX {
        let candidate = if n == 0 {
            path.to_path_buf()
        } else {
            path.with_file_name(with_suffix(name, &n.to_string()))
        };
        match File::options().write(true).create_new(true).open(&candidate) {
            Ok(file) => return Ok((candidate, file)),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e),
        }
    }
    Err(io::Error::new(io::ErrorKind::AlreadyExists, "no free file name"))
}

fn scan(root: &Path) -> Result<HashMap<String, FileMetadata>, CatalogError> {
    if !root.is_dir() {
        return Err(CatalogError::NotADirectory(root.to_path_buf()));
    }
    let mut index: HashMap<String, FileMetadata> = HashMap::new();
    for entry in fs::read_dir(root).map_err(io_error(root))? {
        let path = match entry {
            Ok(e) => e.path(),
            Err(e) => {
                warn!(folder = %root.display(), error = %e, "unreadable directory entry");
                continue;
            }
        };
        if !path.is_file() {
            continue;
        }
        let meta = match FileMetadata::from_path(&path) {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, "skipping file");
                continue;
            }
        };
        match index.get(&meta.content_hash) {
            Some(kept) if !meta.supersedes(kept) => {
                debug!(kept = %kept.file_name, dropped = %meta.file_name, "duplicate content");
            }
            _ => {
                index.insert(meta.content_hash.clone(), meta);
            }
        }
    }
    Ok(index)
}

fn load_blocks(path: &Path, block_size: u64) -> io::Result<BlockMap> {
    let bytes = fs::read(path)?;
    Ok(split_into_blocks(&bytes, block_size)
        .into_iter()
        .map(|b| (b.offset, b))
        .collect())
}

fn write_blocks(file: File, blocks: &[Vec<u8>]) -> io::Result<()> {
    let mut out = BufWriter::new(file);
    for block in blocks {
        out.write_all(block)?;
    }
    out.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::time::Duration;

    fn config(block_size: u64) -> Config {
        Config {
            block_size,
            ..Config::default()
        }
    }

    fn folder_with(files: &[(&str, &[u8])]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for (name, data) in files {
            fs::write(dir.path().join(name), data).unwrap();
        }
        dir
    }

    #[test]
    fn open_rejects_missing_folder() {
        let err = WorkFolder::open("/no/such/folder", &Config::default()).err().unwrap();
        assert!(matches!(err, CatalogError::NotADirectory(_)));
    }

    #[test]
    fn indexes_direct_files_only() {
        let dir = folder_with(&[("notes.txt", b"0123456789"), ("song.mp3", b"la la")]);
        fs::create_dir(dir.path().join("nested")).unwrap();
        fs::write(dir.path().join("nested/deep.txt"), b"deep").unwrap();
        let wf = WorkFolder::open(dir.path(), &config(4)).unwrap();
        let names: Vec<String> = wf.entries().into_iter().map(|m| m.file_name).collect();
        assert_eq!(names, vec!["notes.txt", "song.mp3"]);
        let notes = &wf.search_by_keyword("notes")[0];
        assert_eq!(notes.file_size, 10);
        assert_eq!(notes.content_hash, integrity::hash_bytes(b"0123456789"));
    }

    #[test]
    fn refresh_twice_is_stable() {
        let dir = folder_with(&[("a.txt", b"aaa"), ("b.txt", b"bbb")]);
        let wf = WorkFolder::open(dir.path(), &config(4)).unwrap();
        let first = wf.entries();
        assert_eq!(wf.refresh().unwrap(), 2);
        assert_eq!(wf.entries(), first);
    }

    #[test]
    fn refresh_picks_up_new_and_removed_files() {
        let dir = folder_with(&[("a.txt", b"aaa")]);
        let wf = WorkFolder::open(dir.path(), &config(4)).unwrap();
        fs::write(dir.path().join("b.txt"), b"bbb").unwrap();
        fs::remove_file(dir.path().join("a.txt")).unwrap();
        wf.refresh().unwrap();
        let names: Vec<String> = wf.entries().into_iter().map(|m| m.file_name).collect();
        assert_eq!(names, vec!["b.txt"]);
    }

    #[test]
    fn keyword_search_ignores_case() {
        let dir = folder_with(&[("Report.PDF", b"r"), ("notes.txt", b"n"), ("annual-report.txt", b"a")]);
        let wf = WorkFolder::open(dir.path(), &config(4)).unwrap();
        let hits: Vec<String> = wf
            .search_by_keyword("REPORT")
            .into_iter()
            .map(|m| m.file_name)
            .collect();
        assert_eq!(hits, vec!["Report.PDF", "annual-report.txt"]);
        assert!(wf.search_by_keyword("missing").is_empty());
        assert_eq!(wf.search_by_keyword("").len(), 3);
    }

    #[test]
    fn duplicate_content_keeps_newest() {
        let dir = folder_with(&[("old.txt", b"same"), ("new.txt", b"same")]);
        let old = File::options().write(true).open(dir.path().join("old.txt")).unwrap();
        old.set_modified(SystemTime::UNIX_EPOCH + Duration::from_secs(1_000)).unwrap();
        let new = File::options().write(true).open(dir.path().join("new.txt")).unwrap();
        new.set_modified(SystemTime::UNIX_EPOCH + Duration::from_secs(2_000)).unwrap();
        drop((old, new));
        let wf = WorkFolder::open(dir.path(), &config(4)).unwrap();
        let entries = wf.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].file_name, "new.txt");
    }

    #[test]
    fn blocks_are_served_with_truncated_tail() {
        let dir = folder_with(&[("notes.txt", b"0123456789")]);
        let wf = WorkFolder::open(dir.path(), &config(4)).unwrap();
        let hash = integrity::hash_bytes(b"0123456789");
        assert_eq!(wf.get_block(&hash, 0).unwrap().data, b"0123");
        assert_eq!(wf.get_block(&hash, 4).unwrap().data, b"4567");
        let tail = wf.get_block(&hash, 8).unwrap();
        assert_eq!((tail.offset, tail.data.as_slice()), (8, &b"89"[..]));
        assert!(wf.get_block(&hash, 12).is_none());
        assert!(wf.get_block(&hash, 3).is_none());
        assert!(wf.get_block("unknown", 0).is_none());
    }

    #[test]
    fn cached_blocks_survive_file_deletion() {
        let dir = folder_with(&[("notes.txt", b"0123456789")]);
        let wf = WorkFolder::open(dir.path(), &config(4)).unwrap();
        let hash = integrity::hash_bytes(b"0123456789");
        assert!(wf.get_block(&hash, 0).is_some());
        fs::remove_file(dir.path().join("notes.txt")).unwrap();
        assert_eq!(wf.get_block(&hash, 4).unwrap().data, b"4567");
    }

    #[test]
    fn write_and_index_round_trip() {
        let src = folder_with(&[("data.bin", &[7u8; 23][..])]);
        let dst = tempfile::tempdir().unwrap();
        let source = WorkFolder::open(src.path(), &config(5)).unwrap();
        let target = WorkFolder::open(dst.path(), &config(5)).unwrap();
        let meta = source.search_by_keyword("data").remove(0);

        let blocks: Vec<Vec<u8>> = (0..meta.file_size)
            .step_by(5)
            .map(|off| source.get_block(&meta.content_hash, off).unwrap().data)
            .collect();
        let path = target.timestamped_path("data.bin").unwrap();
        let written = target.write_and_index(&path, &blocks).unwrap();

        assert_eq!(written.content_hash, meta.content_hash);
        assert_eq!(fs::read(&path).unwrap(), vec![7u8; 23]);
        assert!(target.get(&meta.content_hash).is_some());
        assert_eq!(path.parent().unwrap(), dst.path());
    }

    #[test]
    fn timestamp_goes_before_extension() {
        let at = NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap();
        assert_eq!(timestamped_name("report.pdf", &at), "report_20240101_120000.pdf");
        assert_eq!(timestamped_name("archive.tar.gz", &at), "archive.tar_20240101_120000.gz");
        assert_eq!(timestamped_name("README", &at), "README_20240101_120000");
        assert_eq!(timestamped_name(".bashrc", &at), ".bashrc_20240101_120000");
    }

    #[test]
    fn write_never_overwrites_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let wf = WorkFolder::open(dir.path(), &config(4)).unwrap();
        assert_eq!(wf.block_size(), 4);
        let path = dir.path().join("notes_20240101_120000.txt");

        let first = wf.write_and_index(&path, &[b"first".to_vec()]).unwrap();
        let second = wf.write_and_index(&path, &[b"second".to_vec()]).unwrap();
        let third = wf.write_and_index(&path, &[b"third".to_vec()]).unwrap();

        assert_eq!(first.path, path);
        assert_eq!(second.path, dir.path().join("notes_20240101_120000_1.txt"));
        assert_eq!(third.path, dir.path().join("notes_20240101_120000_2.txt"));
        assert_eq!(fs::read(&first.path).unwrap(), b"first");
        assert_eq!(fs::read(&second.path).unwrap(), b"second");
        assert_eq!(wf.get(&first.content_hash).unwrap().path, first.path);
        assert_eq!(wf.entries().len(), 3);
    }

    #[test]
    fn timestamped_path_strips_directories() {
        let dir = tempfile::tempdir().unwrap();
        let wf = WorkFolder::open(dir.path(), &Config::default()).unwrap();
        let p = wf.timestamped_path("../../etc/notes.txt").unwrap();
        assert_eq!(p.parent().unwrap(), dir.path());
        let name = p.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("notes_") && name.ends_with(".txt"));
        assert!(matches!(wf.timestamped_path(".."), Err(CatalogError::InvalidName(_))));
    }
}
