//! Per-repository file index
//!
//! A `FileSet` holds one file map per node (the local node included)
//! together with two derived views that are maintained on every
//! mutation: the global view (the per-name winner across all nodes by
//! Lamport version, NodeId tiebreak) and the need view (what a given
//! node must fetch to match the global view). A per-node change counter
//! drives the broadcast loop.
//!
//! All methods are internally synchronized; the `with_*` iterators hold
//! the read guard for the duration of the visit and therefore observe a
//! consistent snapshot. A remote node's map can be shed to the optional
//! redb backing store and is transparently read through or reloaded.

pub mod db;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock};
use tracing::warn;

use crate::clock::LamportClock;
use crate::types::{FileInfo, NodeId, FLAG_DELETED};
use db::IndexDb;

enum NodeMap {
	Loaded(BTreeMap<String, FileInfo>),
	/// Entries live in the backing store only.
	Shed,
}

#[derive(Default)]
struct Inner {
	files: BTreeMap<NodeId, NodeMap>,
	global: BTreeMap<String, FileInfo>,
	changes: BTreeMap<NodeId, u64>,
}

impl Default for NodeMap {
	fn default() -> Self {
		NodeMap::Loaded(BTreeMap::new())
	}
}

pub struct FileSet {
	repo: String,
	local: NodeId,
	clock: Arc<LamportClock>,
	backing: Option<Arc<IndexDb>>,
	inner: RwLock<Inner>,
}

impl FileSet {
	pub fn new(repo: &str, local: NodeId, clock: Arc<LamportClock>) -> Self {
		FileSet {
			repo: repo.to_string(),
			local,
			clock,
			backing: None,
			inner: RwLock::new(Inner::default()),
		}
	}

	pub fn with_backing(repo: &str, local: NodeId, clock: Arc<LamportClock>, db: Arc<IndexDb>) -> Self {
		FileSet { backing: Some(db), ..Self::new(repo, local, clock) }
	}

	pub fn repo(&self) -> &str {
		&self.repo
	}

	/// Map the LOCAL sentinel to the real local id, so that version
	/// tie-breaks always compare real ids.
	fn resolve(&self, node: NodeId) -> NodeId {
		if node.is_local() {
			self.local
		} else {
			node
		}
	}

	/// Atomically replace `node`'s entire map.
	pub fn replace(&self, node: NodeId, files: Vec<FileInfo>) {
		self.replace_internal(node, files, false);
	}

	/// Like `replace`, but names present before and absent from `files`
	/// are retained as deletion tombstones with a fresh Lamport
	/// version. Used when the scanner's sweep of the directory is
	/// authoritative.
	pub fn replace_with_delete(&self, node: NodeId, files: Vec<FileInfo>) {
		self.replace_internal(node, files, true);
	}

	fn replace_internal(&self, node: NodeId, files: Vec<FileInfo>, with_delete: bool) {
		let node = self.resolve(node);
		let mut new_map: BTreeMap<String, FileInfo> =
			files.into_iter().map(|f| (f.name.clone(), f)).collect();

		let mut inner = self.inner.write().unwrap();
		let affected: BTreeSet<String>;
		{
			let map = load_map(&mut inner.files, &self.backing, &self.repo, node);
			if with_delete {
				for (name, old) in map.iter() {
					if new_map.contains_key(name) {
						continue;
					}
					if old.is_deleted() {
						// Already a tombstone; re-announcing it with a
						// fresh version would rebroadcast forever.
						new_map.insert(name.clone(), old.clone());
					} else {
						let mut tomb = old.clone();
						tomb.flags |= FLAG_DELETED;
						tomb.version = self.clock.tick(old.version);
						tomb.blocks = vec![];
						tomb.size = 0;
						new_map.insert(name.clone(), tomb);
					}
				}
			}
			affected = map.keys().cloned().chain(new_map.keys().cloned()).collect();
			if let Some(db) = &self.backing {
				if let Err(e) = db.replace_node(&self.repo, node, &new_map) {
					warn!("index db write for {}/{} failed: {}", self.repo, node.short(), e);
				}
			}
			*map = new_map;
		}

		*inner.changes.entry(node).or_insert(0) += 1;
		let Inner { files, global, .. } = &mut *inner;
		recompute_global(&self.repo, &self.backing, files, global, affected);
	}

	/// Merge `files` into `node`'s map. An incoming entry replaces the
	/// stored one iff its version is greater or equal; older entries
	/// are dropped.
	pub fn update(&self, node: NodeId, incoming: Vec<FileInfo>) {
		let node = self.resolve(node);
		let mut inner = self.inner.write().unwrap();
		let mut affected = BTreeSet::new();
		let mut accepted = Vec::new();
		{
			let map = load_map(&mut inner.files, &self.backing, &self.repo, node);
			for f in incoming {
				let stored = map.get(&f.name).map(|e| e.version).unwrap_or(0);
				if f.version >= stored {
					affected.insert(f.name.clone());
					accepted.push(f.clone());
					map.insert(f.name.clone(), f);
				}
			}
		}

		if let Some(db) = &self.backing {
			if let Err(e) = db.put_many(&self.repo, node, &accepted) {
				warn!("index db write for {}/{} failed: {}", self.repo, node.short(), e);
			}
		}

		*inner.changes.entry(node).or_insert(0) += 1;
		let Inner { files, global, .. } = &mut *inner;
		recompute_global(&self.repo, &self.backing, files, global, affected);
	}

	/// The stored entry, or the zero FileInfo if absent.
	pub fn get(&self, node: NodeId, name: &str) -> FileInfo {
		let node = self.resolve(node);
		let inner = self.inner.read().unwrap();
		lookup(&inner.files, &self.backing, &self.repo, node, name)
	}

	/// The global winner for `name`, or the zero FileInfo.
	pub fn get_global(&self, name: &str) -> FileInfo {
		let inner = self.inner.read().unwrap();
		inner.global.get(name).cloned().unwrap_or_default()
	}

	/// Visit `node`'s entries in name order. Returning `false` from the
	/// visitor terminates the iteration.
	pub fn with_have<F>(&self, node: NodeId, mut visit: F)
	where
		F: FnMut(&FileInfo) -> bool,
	{
		let node = self.resolve(node);
		let inner = self.inner.read().unwrap();
		match inner.files.get(&node) {
			None => {}
			Some(NodeMap::Loaded(map)) => {
				for f in map.values() {
					if !visit(f) {
						return;
					}
				}
			}
			Some(NodeMap::Shed) => {
				let backing = self.backing.as_ref().expect("shed map without backing");
				match backing.node_files(&self.repo, node) {
					Ok(files) => {
						for f in &files {
							if !visit(f) {
								return;
							}
						}
					}
					Err(e) => warn!("index db read for {}/{} failed: {}", self.repo, node.short(), e),
				}
			}
		}
	}

	/// Visit the global view in name order.
	pub fn with_global<F>(&self, mut visit: F)
	where
		F: FnMut(&FileInfo) -> bool,
	{
		let inner = self.inner.read().unwrap();
		for f in inner.global.values() {
			if !visit(f) {
				return;
			}
		}
	}

	/// Visit the files `node` must fetch to match the global view: the
	/// global winner is newer than the node's copy (or the node lacks
	/// one), except that a deletion of a file the node never had is not
	/// needed.
	///
	/// "Newer" uses the same total order as winner selection: a winner
	/// at an equal version that is not the node's own copy (it won the
	/// NodeId tiebreak) is still needed, which is what makes an
	/// operator override of a split-brain conflict effective.
	pub fn with_need<F>(&self, node: NodeId, mut visit: F)
	where
		F: FnMut(&FileInfo) -> bool,
	{
		let node = self.resolve(node);
		let inner = self.inner.read().unwrap();
		for (name, g) in &inner.global {
			let h = lookup(&inner.files, &self.backing, &self.repo, node, name);
			let newer = g.version > h.version || (g.version == h.version && *g != h);
			if newer && !(g.is_deleted() && h.is_empty()) {
				if !visit(g) {
					return;
				}
			}
		}
	}

	/// Monotonic change counter for `node`'s map.
	pub fn changes(&self, node: NodeId) -> u64 {
		let node = self.resolve(node);
		let inner = self.inner.read().unwrap();
		inner.changes.get(&node).copied().unwrap_or(0)
	}

	/// Nodes whose copy of `name` is the winning version.
	pub fn availability(&self, name: &str) -> Vec<NodeId> {
		let inner = self.inner.read().unwrap();
		let g = match inner.global.get(name) {
			Some(g) => g,
			None => return vec![],
		};
		let mut nodes = Vec::new();
		for node in inner.files.keys() {
			let f = lookup(&inner.files, &self.backing, &self.repo, *node, name);
			if !f.is_empty() && !f.is_invalid() && f.version == g.version {
				nodes.push(*node);
			}
		}
		nodes
	}

	/// Drop a remote node's in-memory map; entries stay in the backing
	/// store (kept current by write-through) and are read through or
	/// reloaded on demand. No-op for the local map or without backing.
	pub fn shed(&self, node: NodeId) {
		let node = self.resolve(node);
		if node == self.local || self.backing.is_none() {
			return;
		}
		let mut inner = self.inner.write().unwrap();
		if let Some(entry) = inner.files.get_mut(&node) {
			*entry = NodeMap::Shed;
		}
	}
}

fn lookup(
	files: &BTreeMap<NodeId, NodeMap>,
	backing: &Option<Arc<IndexDb>>,
	repo: &str,
	node: NodeId,
	name: &str,
) -> FileInfo {
	match files.get(&node) {
		None => FileInfo::default(),
		Some(NodeMap::Loaded(map)) => map.get(name).cloned().unwrap_or_default(),
		Some(NodeMap::Shed) => {
			let db = backing.as_ref().expect("shed map without backing");
			match db.get(repo, node, name) {
				Ok(f) => f.unwrap_or_default(),
				Err(e) => {
					warn!("index db read for {}/{} failed: {}", repo, node.short(), e);
					FileInfo::default()
				}
			}
		}
	}
}

fn load_map<'a>(
	files: &'a mut BTreeMap<NodeId, NodeMap>,
	backing: &Option<Arc<IndexDb>>,
	repo: &str,
	node: NodeId,
) -> &'a mut BTreeMap<String, FileInfo> {
	let entry = files.entry(node).or_default();
	if let NodeMap::Shed = entry {
		let db = backing.as_ref().expect("shed map without backing");
		let loaded = match db.node_files(repo, node) {
			Ok(files) => files.into_iter().map(|f| (f.name.clone(), f)).collect(),
			Err(e) => {
				warn!("index db read for {}/{} failed: {}", repo, node.short(), e);
				BTreeMap::new()
			}
		};
		*entry = NodeMap::Loaded(loaded);
	}
	match entry {
		NodeMap::Loaded(map) => map,
		NodeMap::Shed => unreachable!(),
	}
}

/// Recompute the global winner for each affected name: the largest
/// version wins, ties broken by the larger NodeId; invalid copies never
/// participate.
fn recompute_global(
	repo: &str,
	backing: &Option<Arc<IndexDb>>,
	files: &BTreeMap<NodeId, NodeMap>,
	global: &mut BTreeMap<String, FileInfo>,
	affected: BTreeSet<String>,
) {
	for name in affected {
		let mut best: Option<(FileInfo, NodeId)> = None;
		for node in files.keys() {
			let f = lookup(files, backing, repo, *node, &name);
			if f.is_empty() || f.is_invalid() {
				continue;
			}
			let better = match &best {
				Some((bf, bn)) => (f.version, *node) > (bf.version, *bn),
				None => true,
			};
			if better {
				best = Some((f, *node));
			}
		}
		match best {
			Some((f, _)) => {
				global.insert(name, f);
			}
			None => {
				global.remove(&name);
			}
		}
	}
}


// vim: ts=4
