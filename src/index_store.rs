//! On-disk index snapshots
//!
//! Persists the local file index of each repository so a restart does
//! not force a full re-hash. One gzip-compressed JSON record per
//! repository, named after the SHA-1 of the repository directory, with
//! crash-atomic writes (temp file, fsync, rename).

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

use crate::types::{FileInfo, FLAG_INVALID};

/// Self-describing snapshot payload. The repository id is stored so a
/// renamed directory cannot feed a foreign index into the wrong repo.
#[derive(Serialize, Deserialize)]
struct IndexRecord {
	repo: String,
	files: Vec<FileInfo>,
}

/// Loads and atomically writes per-repository index snapshots.
pub struct IndexStore {
	dir: PathBuf,
}

impl IndexStore {
	pub fn new(dir: PathBuf) -> Self {
		IndexStore { dir }
	}

	fn index_path(&self, repo_dir: &Path) -> PathBuf {
		let digest = Sha1::digest(repo_dir.to_string_lossy().as_bytes());
		self.dir.join(format!("{}.idx.gz", hex::encode(digest)))
	}

	/// Serialize and write the snapshot for `repo`. The write is
	/// crash-atomic: a temp file is written and fsynced, then renamed
	/// over the final name.
	pub fn save(&self, repo: &str, repo_dir: &Path, files: &[FileInfo]) -> io::Result<()> {
		fs::create_dir_all(&self.dir)?;

		let path = self.index_path(repo_dir);
		let nanos = SystemTime::now()
			.duration_since(UNIX_EPOCH)
			.map(|d| d.as_nanos())
			.unwrap_or_default();
		let tmp = PathBuf::from(format!("{}.tmp.{}", path.display(), nanos));

		let record = IndexRecord { repo: repo.to_string(), files: files.to_vec() };
		let file = fs::File::create(&tmp)?;
		let mut gz = GzEncoder::new(file, Compression::default());
		serde_json::to_writer(&mut gz, &record)
			.map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
		let file = gz.finish()?;
		file.sync_all()?;
		drop(file);

		fs::rename(&tmp, &path)?;
		debug!("saved index for {} ({} files)", repo, record.files.len());
		Ok(())
	}

	/// Load the snapshot for `repo`. Returns an empty list on any
	/// error, or if the decoded record belongs to a different
	/// repository. The INVALID flag is cleared on every loaded entry: a
	/// previously suppressed file gets a fresh chance after a restart.
	pub fn load(&self, repo: &str, repo_dir: &Path) -> Vec<FileInfo> {
		let path = self.index_path(repo_dir);
		let mut record = match self.read_record(&path) {
			Ok(r) => r,
			Err(e) => {
				debug!("no index for {}: {}", repo, e);
				return vec![];
			}
		};

		if record.repo != repo {
			warn!("index {} belongs to repository {}, expected {}", path.display(), record.repo, repo);
			return vec![];
		}

		for f in &mut record.files {
			f.flags &= !FLAG_INVALID;
		}
		record.files
	}

	fn read_record(&self, path: &Path) -> io::Result<IndexRecord> {
		let file = fs::File::open(path)?;
		let gz = GzDecoder::new(file);
		serde_json::from_reader(gz).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::types::{Block, FLAG_DELETED};
	use tempfile::TempDir;

	fn sample_files() -> Vec<FileInfo> {
		vec![
			FileInfo {
				name: "a/b".into(),
				flags: 0o644,
				modified: 1_700_000_000,
				version: 7,
				size: 5,
				blocks: vec![Block { offset: 0, size: 5, hash: [3; 32] }],
			},
			FileInfo {
				name: "gone".into(),
				flags: FLAG_DELETED | 0o644,
				modified: 1_700_000_001,
				version: 9,
				size: 0,
				blocks: vec![],
			},
		]
	}

	#[test]
	fn test_round_trip_preserves_fields() {
		let tmp = TempDir::new().unwrap();
		let store = IndexStore::new(tmp.path().join("index"));
		let dir = Path::new("/data/repo");

		let files = sample_files();
		store.save("r", dir, &files).unwrap();
		let loaded = store.load("r", dir);
		assert_eq!(loaded, files);
	}

	#[test]
	fn test_load_clears_invalid_flag() {
		let tmp = TempDir::new().unwrap();
		let store = IndexStore::new(tmp.path().join("index"));
		let dir = Path::new("/data/repo");

		let mut files = sample_files();
		files[0].flags |= FLAG_INVALID;
		store.save("r", dir, &files).unwrap();

		let loaded = store.load("r", dir);
		assert_eq!(loaded[0].flags & FLAG_INVALID, 0);
		assert_eq!(loaded[0].version, files[0].version);
	}

	#[test]
	fn test_load_missing_returns_empty() {
		let tmp = TempDir::new().unwrap();
		let store = IndexStore::new(tmp.path().join("index"));
		assert!(store.load("r", Path::new("/nowhere")).is_empty());
	}

	#[test]
	fn test_load_repo_mismatch_returns_empty() {
		let tmp = TempDir::new().unwrap();
		let store = IndexStore::new(tmp.path().join("index"));
		let dir = Path::new("/data/repo");

		store.save("other", dir, &sample_files()).unwrap();
		assert!(store.load("r", dir).is_empty());
	}

	#[test]
	fn test_load_corrupt_returns_empty() {
		let tmp = TempDir::new().unwrap();
		let index_dir = tmp.path().join("index");
		let store = IndexStore::new(index_dir.clone());
		let dir = Path::new("/data/repo");

		store.save("r", dir, &sample_files()).unwrap();
		// Truncate the snapshot in place.
		let path = store.index_path(dir);
		fs::write(&path, b"not gzip").unwrap();
		assert!(store.load("r", dir).is_empty());
	}

	#[test]
	fn test_save_leaves_no_temp_files() {
		let tmp = TempDir::new().unwrap();
		let index_dir = tmp.path().join("index");
		let store = IndexStore::new(index_dir.clone());

		store.save("r", Path::new("/data/repo"), &sample_files()).unwrap();
		let leftovers: Vec<_> = fs::read_dir(&index_dir)
			.unwrap()
			.filter_map(|e| e.ok())
			.filter(|e| e.file_name().to_string_lossy().contains(".tmp."))
			.collect();
		assert!(leftovers.is_empty());
	}
}

// vim: ts=4
