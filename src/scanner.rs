//! Directory walker and block hasher
//!
//! Walks a repository tree, producing one `FileInfo` per file and
//! directory with fresh blake3 block hashes. A `CurrentFiler` lets the
//! walker skip re-hashing files whose mtime and permissions are
//! unchanged; the suppressor marks files that change too fast as
//! invalid instead of hashing them.

use globset::{Glob, GlobSet, GlobSetBuilder};
use std::fs;
use std::io::{self, Read};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Instant, UNIX_EPOCH};
use tracing::{debug, warn};

use crate::clock::LamportClock;
use crate::fileset::FileSet;
use crate::suppressor::Suppressor;
use crate::types::{Block, FileInfo, NodeId, FLAG_DIRECTORY, FLAG_INVALID, FLAG_PERM_MASK};

/// Per-repository ignore pattern file, one glob per line.
pub const DEFAULT_IGNORE_FILE: &str = ".syncignore";

const TEMP_PREFIX: &str = ".msync.";

/// Local view handle given to walkers and pullers.
pub trait CurrentFiler: Send + Sync {
	/// The local index entry for `name`, or the zero FileInfo.
	fn current_file(&self, name: &str) -> FileInfo;
}

impl CurrentFiler for Arc<FileSet> {
	fn current_file(&self, name: &str) -> FileInfo {
		self.get(NodeId::LOCAL, name)
	}
}

/// Produces and recognizes the names of in-flight temporary files.
/// Temporaries live in the repository root so a crashed pull never
/// leaves debris deeper in the tree.
#[derive(Debug, Clone, Default)]
pub struct TempNamer;

impl TempNamer {
	pub fn temp_name(&self, name: &str) -> String {
		format!("{}{}.tmp", TEMP_PREFIX, name.replace('/', "_"))
	}

	pub fn is_temporary(&self, file_name: &str) -> bool {
		file_name.starts_with(TEMP_PREFIX)
	}
}

/// Remove leftover temporaries under `dir`. Returns how many were
/// deleted.
pub fn clean_temp_files(dir: &Path, namer: &TempNamer) -> io::Result<usize> {
	let mut removed = 0;
	for entry in fs::read_dir(dir)? {
		let entry = entry?;
		let file_type = entry.file_type()?;
		if file_type.is_dir() {
			removed += clean_temp_files(&entry.path(), namer)?;
		} else if namer.is_temporary(&entry.file_name().to_string_lossy()) {
			debug!("removing stale temporary {}", entry.path().display());
			fs::remove_file(entry.path())?;
			removed += 1;
		}
	}
	Ok(removed)
}

pub struct Walker {
	/// Repository root.
	pub dir: PathBuf,
	pub ignore_file: String,
	pub block_size: usize,
	pub temp_namer: TempNamer,
	pub suppressor: Option<Arc<Suppressor>>,
	pub current_filer: Option<Box<dyn CurrentFiler>>,
	pub ignore_perms: bool,
	pub clock: Arc<LamportClock>,
}

impl Walker {
	/// Walk the tree. Returns the scanned entries and the number of
	/// entries skipped by ignore patterns.
	pub fn walk(&self) -> io::Result<(Vec<FileInfo>, usize)> {
		let ignores = self.load_ignores();
		let mut files = Vec::new();
		let mut ignored = 0;
		self.walk_dir("", &ignores, &mut files, &mut ignored)?;
		Ok((files, ignored))
	}

	fn walk_dir(
		&self,
		rel: &str,
		ignores: &GlobSet,
		files: &mut Vec<FileInfo>,
		ignored: &mut usize,
	) -> io::Result<()> {
		let abs = if rel.is_empty() { self.dir.clone() } else { self.dir.join(rel) };
		for entry in fs::read_dir(&abs)? {
			let entry = entry?;
			let file_name = entry.file_name();
			let file_name = match file_name.to_str() {
				Some(s) => s.to_string(),
				None => {
					warn!("skipping non-UTF-8 name {:?} in {}", file_name, abs.display());
					continue;
				}
			};
			if file_name == self.ignore_file || self.temp_namer.is_temporary(&file_name) {
				continue;
			}

			let name =
				if rel.is_empty() { file_name } else { format!("{}/{}", rel, file_name) };
			if ignores.is_match(&name) {
				*ignored += 1;
				continue;
			}

			let meta = entry.metadata()?;
			let file_type = meta.file_type();
			if file_type.is_dir() {
				files.push(self.dir_entry(&name, &meta));
				self.walk_dir(&name, ignores, files, ignored)?;
			} else if file_type.is_file() {
				if let Some(f) = self.file_entry(&name, &entry.path(), &meta) {
					files.push(f);
				}
			} else {
				debug!("skipping special file {}", name);
			}
		}
		Ok(())
	}

	fn current(&self, name: &str) -> FileInfo {
		self.current_filer.as_ref().map(|cf| cf.current_file(name)).unwrap_or_default()
	}

	fn dir_entry(&self, name: &str, meta: &fs::Metadata) -> FileInfo {
		let perms = meta.permissions().mode() & FLAG_PERM_MASK;
		let cur = self.current(name);

		// Directories are compared on permissions only; their mtime
		// changes with every child mutation.
		if cur.is_directory()
			&& !cur.is_deleted()
			&& (self.ignore_perms || cur.permissions() == perms)
		{
			return cur;
		}

		FileInfo {
			name: name.to_string(),
			flags: FLAG_DIRECTORY | perms,
			modified: mtime_secs(meta),
			version: self.clock.tick(cur.version),
			size: 0,
			blocks: vec![],
		}
	}

	fn file_entry(&self, name: &str, path: &Path, meta: &fs::Metadata) -> Option<FileInfo> {
		let perms = meta.permissions().mode() & FLAG_PERM_MASK;
		let modified = mtime_secs(meta);
		let cur = self.current(name);

		let unchanged = !cur.is_empty()
			&& !cur.is_deleted()
			&& !cur.is_invalid()
			&& !cur.is_directory()
			&& cur.modified == modified
			&& (self.ignore_perms || cur.permissions() == perms);
		if unchanged {
			return Some(cur);
		}

		if let Some(sup) = &self.suppressor {
			let (suppressed, bps) = sup.suppress(name, meta.len(), Instant::now());
			if suppressed {
				warn!("{} changing too fast ({:.0} bytes/s); marking invalid", name, bps);
				return Some(FileInfo {
					name: name.to_string(),
					flags: perms | FLAG_INVALID,
					modified,
					version: self.clock.tick(cur.version),
					size: meta.len(),
					blocks: vec![],
				});
			}
		}

		let (blocks, size) = match self.hash_blocks(path) {
			Ok(r) => r,
			Err(e) => {
				warn!("hashing {}: {}; skipping", name, e);
				return None;
			}
		};

		Some(FileInfo {
			name: name.to_string(),
			flags: perms,
			modified,
			version: self.clock.tick(cur.version),
			size,
			blocks,
		})
	}

	fn hash_blocks(&self, path: &Path) -> io::Result<(Vec<Block>, u64)> {
		let mut file = fs::File::open(path)?;
		let mut blocks = Vec::new();
		let mut offset = 0u64;
		let mut buf = vec![0u8; self.block_size];

		loop {
			let mut filled = 0;
			while filled < buf.len() {
				let n = file.read(&mut buf[filled..])?;
				if n == 0 {
					break;
				}
				filled += n;
			}
			if filled == 0 {
				break;
			}
			blocks.push(Block {
				offset,
				size: filled as u32,
				hash: *blake3::hash(&buf[..filled]).as_bytes(),
			});
			offset += filled as u64;
			if filled < buf.len() {
				break;
			}
		}

		Ok((blocks, offset))
	}

	fn load_ignores(&self) -> GlobSet {
		let path = self.dir.join(&self.ignore_file);
		let contents = match fs::read_to_string(&path) {
			Ok(c) => c,
			Err(_) => return GlobSet::empty(),
		};

		let mut builder = GlobSetBuilder::new();
		for line in contents.lines() {
			let line = line.trim();
			if line.is_empty() || line.starts_with('#') {
				continue;
			}
			match Glob::new(line) {
				Ok(glob) => {
					builder.add(glob);
				}
				Err(e) => warn!("{}: invalid pattern {:?}: {}", path.display(), line, e),
			}
		}
		builder.build().unwrap_or_else(|e| {
			warn!("{}: {}", path.display(), e);
			GlobSet::empty()
		})
	}
}

fn mtime_secs(meta: &fs::Metadata) -> i64 {
	meta.modified()
		.ok()
		.and_then(|t| t.duration_since(UNIX_EPOCH).ok())
		.map(|d| d.as_secs() as i64)
		.unwrap_or(0)
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn test_temp_namer() {
		let namer = TempNamer::default();
		let t = namer.temp_name("sub/file.txt");
		assert!(namer.is_temporary(&t));
		assert!(!t.contains('/'));
		assert!(!namer.is_temporary("file.txt"));
	}

	#[test]
	fn test_temp_names_are_distinct_per_path() {
		let namer = TempNamer::default();
		assert_ne!(namer.temp_name("a/b"), namer.temp_name("a/c"));
	}
}

// vim: ts=4
