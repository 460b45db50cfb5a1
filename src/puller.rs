//! Block-level puller
//!
//! One puller per read-write repository. Each pull cycle walks the need
//! set: deletions and directories are applied directly, files are
//! reconstructed block by block from peers holding the winning version,
//! written to a temporary in the repository root, verified, renamed
//! into place and adopted into the local index with the winner's
//! version. Failures are logged and retried on the next cycle; the
//! puller itself never gives up.

use filetime::FileTime;
use futures::StreamExt;
use std::cmp::Reverse;
use std::collections::HashMap;
use std::io::{self, SeekFrom};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info};

use crate::config::PullOrder;
use crate::error::ModelError;
use crate::model::{Model, RepoState};
use crate::scanner::TempNamer;
use crate::types::{Block, FileInfo, NodeId};

pub const DEFAULT_PULL_INTERVAL: Duration = Duration::from_secs(10);

pub struct Puller {
	pub repo: String,
	pub dir: PathBuf,
	pub model: Arc<Model>,
	/// Concurrent file slots.
	pub threads: usize,
	pub temp_namer: TempNamer,
	pub ignore_perms: bool,
	pub order: PullOrder,
	pub interval: Duration,
}

impl Puller {
	/// Spawn the pull loop.
	pub fn run(self) {
		tokio::spawn(async move {
			info!("puller for {} started ({} workers)", self.repo, self.threads);
			loop {
				tokio::time::sleep(self.interval).await;
				self.pull_cycle().await;
			}
		});
	}

	async fn pull_cycle(&self) {
		let mut need = self.model.need_files_repo(&self.repo).await;
		if need.is_empty() {
			return;
		}
		self.sort_need(&mut need);

		debug!("{}: {} entries to pull", self.repo, need.len());
		self.model.set_repo_state(&self.repo, RepoState::Syncing).await;

		futures::stream::iter(need)
			.for_each_concurrent(self.threads.max(1), |file| async move {
				let name = file.name.clone();
				if let Err(e) = self.handle_entry(file).await {
					debug!("pulling {}/{}: {} (will retry)", self.repo, name, e);
				}
			})
			.await;

		self.model.set_repo_state(&self.repo, RepoState::Idle).await;
	}

	fn sort_need(&self, need: &mut Vec<FileInfo>) {
		match self.order {
			// The need view is already name ordered.
			PullOrder::Alphabetic => {}
			PullOrder::SmallestFirst => need.sort_by_key(|f| f.size),
			PullOrder::LargestFirst => need.sort_by_key(|f| Reverse(f.size)),
			PullOrder::NewestFirst => need.sort_by_key(|f| Reverse(f.modified)),
			PullOrder::OldestFirst => need.sort_by_key(|f| f.modified),
		}
	}

	async fn handle_entry(&self, file: FileInfo) -> Result<(), ModelError> {
		if file.is_deleted() {
			self.apply_delete(&file).await?;
		} else if file.is_directory() {
			self.apply_directory(&file).await?;
		} else {
			self.pull_file(&file).await?;
		}
		// Adopt the winner's entry, version included, so the need entry
		// clears and the next broadcast announces it.
		self.model.update_local(&self.repo, file).await;
		Ok(())
	}

	async fn apply_delete(&self, file: &FileInfo) -> Result<(), ModelError> {
		let path = self.dir.join(&file.name);
		match tokio::fs::metadata(&path).await {
			Err(_) => Ok(()),
			Ok(meta) if meta.is_dir() => {
				// Non-recursive on purpose: children have their own
				// tombstones, and a still-populated directory is
				// retried on a later cycle.
				tokio::fs::remove_dir(&path).await.map_err(Into::into)
			}
			Ok(_) => tokio::fs::remove_file(&path).await.map_err(Into::into),
		}
	}

	async fn apply_directory(&self, file: &FileInfo) -> Result<(), ModelError> {
		let path = self.dir.join(&file.name);
		tokio::fs::create_dir_all(&path).await?;
		if !self.ignore_perms {
			tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(file.permissions()))
				.await?;
		}
		Ok(())
	}

	async fn pull_file(&self, file: &FileInfo) -> Result<(), ModelError> {
		let peers = self.model.availability_connected(&self.repo, &file.name).await;
		if peers.is_empty() {
			return Err(ModelError::Io(io::Error::new(
				io::ErrorKind::Other,
				"no connected peer has the winning version",
			)));
		}

		let cur = self.model.current_repo_file(&self.repo, &file.name).await;
		let local_path = self.dir.join(&file.name);
		let temp_path = self.dir.join(self.temp_namer.temp_name(&file.name));

		let mut out = tokio::fs::File::create(&temp_path).await?;
		if let Err(e) = self.fetch_blocks(file, &cur, &local_path, &peers, &mut out).await {
			drop(out);
			let _ = tokio::fs::remove_file(&temp_path).await;
			return Err(e);
		}
		out.sync_all().await?;
		drop(out);

		if !self.ignore_perms {
			tokio::fs::set_permissions(
				&temp_path,
				std::fs::Permissions::from_mode(file.permissions()),
			)
			.await?;
		}
		filetime::set_file_mtime(&temp_path, FileTime::from_unix_time(file.modified, 0))?;

		if let Some(parent) = local_path.parent() {
			tokio::fs::create_dir_all(parent).await?;
		}
		tokio::fs::rename(&temp_path, &local_path).await?;
		debug!("pulled {}/{} ({} blocks)", self.repo, file.name, file.blocks.len());
		Ok(())
	}

	async fn fetch_blocks(
		&self,
		file: &FileInfo,
		cur: &FileInfo,
		local_path: &Path,
		peers: &[NodeId],
		out: &mut tokio::fs::File,
	) -> Result<(), ModelError> {
		let local_blocks: HashMap<[u8; 32], Block> =
			cur.blocks.iter().map(|b| (b.hash, b.clone())).collect();

		for (i, block) in file.blocks.iter().enumerate() {
			let data = match local_blocks.get(&block.hash) {
				Some(have) if !cur.is_invalid() => {
					match read_local_block(local_path, have).await {
						Ok(data) => data,
						Err(_) => self.fetch_remote(file, block, peers, i).await?,
					}
				}
				_ => self.fetch_remote(file, block, peers, i).await?,
			};

			if blake3::hash(&data) != blake3::Hash::from(block.hash) {
				return Err(ModelError::Io(io::Error::new(
					io::ErrorKind::InvalidData,
					format!("block hash mismatch at offset {} of {}", block.offset, file.name),
				)));
			}
			out.write_all(&data).await?;
		}
		Ok(())
	}

	async fn fetch_remote(
		&self,
		file: &FileInfo,
		block: &Block,
		peers: &[NodeId],
		i: usize,
	) -> Result<Vec<u8>, ModelError> {
		let peer = peers[i % peers.len()];
		self.model.request_global(peer, &self.repo, &file.name, block.offset, block.size).await
	}
}

/// Read and verify one block we already have on disk, so unchanged
/// blocks are never fetched over the network.
async fn read_local_block(path: &Path, block: &Block) -> io::Result<Vec<u8>> {
	let mut fd = tokio::fs::File::open(path).await?;
	fd.seek(SeekFrom::Start(block.offset)).await?;
	let mut buf = vec![0u8; block.size as usize];
	fd.read_exact(&mut buf).await?;

	if blake3::hash(&buf) != blake3::Hash::from(block.hash) {
		return Err(io::Error::new(io::ErrorKind::InvalidData, "stale local block"));
	}
	Ok(buf)
}

#[cfg(test)]
mod test {
	use super::*;

	fn entry(name: &str, size: u64, modified: i64) -> FileInfo {
		FileInfo { name: name.into(), size, modified, ..Default::default() }
	}

	fn puller_with(order: PullOrder) -> Puller {
		Puller {
			repo: "r".into(),
			dir: PathBuf::from("."),
			model: Arc::new(Model::new(
				NodeId([1; 32]),
				"meshsync",
				"test",
				Path::new("/tmp/idx"),
			)),
			threads: 1,
			temp_namer: TempNamer::default(),
			ignore_perms: false,
			order,
			interval: DEFAULT_PULL_INTERVAL,
		}
	}

	#[test]
	fn test_sort_need_smallest_first() {
		let p = puller_with(PullOrder::SmallestFirst);
		let mut need = vec![entry("a", 30, 0), entry("b", 10, 0), entry("c", 20, 0)];
		p.sort_need(&mut need);
		let names: Vec<&str> = need.iter().map(|f| f.name.as_str()).collect();
		assert_eq!(names, vec!["b", "c", "a"]);
	}

	#[test]
	fn test_sort_need_newest_first() {
		let p = puller_with(PullOrder::NewestFirst);
		let mut need = vec![entry("a", 0, 100), entry("b", 0, 300), entry("c", 0, 200)];
		p.sort_need(&mut need);
		let names: Vec<&str> = need.iter().map(|f| f.name.as_str()).collect();
		assert_eq!(names, vec!["b", "c", "a"]);
	}
}

// vim: ts=4
