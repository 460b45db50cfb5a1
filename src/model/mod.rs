//! The synchronization model
//!
//! One `Model` per process. It owns the per-repository file sets and
//! suppressors, the connection registry and the repository state map,
//! implements the peer-protocol callbacks, runs the periodic broadcast
//! loop, drives scanners and pullers, and serves block reads from local
//! disk.
//!
//! Shared state is partitioned into three independent reader-writer
//! locks so that a slow peer send can never stall a local scan:
//!
//! - `rmut`: repository configs, repo/node maps, file set and
//!   suppressor handles
//! - `smut`: repository state map
//! - `pmut`: connection registry
//!
//! No lock is ever held across a call into a peer connection. Where
//! both `pmut` and `rmut` are needed, `pmut` is acquired first.

pub mod registry;

use async_trait::async_trait;
use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::clock::LamportClock;
use crate::cluster::{
	compare_cluster_config, ClusterConfigMessage, NodeInfo, RepositoryInfo, FLAG_SHARE_TRUSTED,
};
use crate::config::RepoConfig;
use crate::error::ModelError;
use crate::fileset::db::IndexDb;
use crate::fileset::FileSet;
use crate::index_store::IndexStore;
use crate::protocol::{MessageHandler, PeerConnection};
use crate::puller::{Puller, DEFAULT_PULL_INTERVAL};
use crate::scanner::{clean_temp_files, TempNamer, Walker, DEFAULT_IGNORE_FILE};
use crate::suppressor::{Suppressor, DEFAULT_THRESHOLD_KBPS};
use crate::types::{FileInfo, NodeId, BLOCK_SIZE, FLAG_DELETED};
use registry::{ConnectionInfo, ConnectionRegistry};

/// Initial index sends are split into batches of this many entries to
/// bound memory and latency on large repositories.
pub const INDEX_BATCH_SIZE: usize = 1000;

/// Default broadcast loop period.
pub const DEFAULT_BROADCAST_INTERVAL: Duration = Duration::from_secs(5);

const DEFAULT_DEADLOCK_TIMEOUT: Duration = Duration::from_secs(1200);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepoState {
	Idle,
	Scanning,
	Syncing,
	Cleaning,
}

impl std::fmt::Display for RepoState {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			RepoState::Idle => write!(f, "idle"),
			RepoState::Scanning => write!(f, "scanning"),
			RepoState::Syncing => write!(f, "syncing"),
			RepoState::Cleaning => write!(f, "cleaning"),
		}
	}
}

/// Entry and byte counts over one of the index views.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counts {
	pub files: usize,
	pub deleted: usize,
	pub bytes: u64,
}

impl Counts {
	fn add(&mut self, f: &FileInfo) {
		if f.is_deleted() {
			self.deleted += 1;
		} else {
			self.files += 1;
		}
		self.bytes += f.entry_size();
	}
}

#[derive(Default)]
struct Repos {
	cfgs: HashMap<String, RepoConfig>,
	files: HashMap<String, Arc<FileSet>>,
	suppressors: HashMap<String, Arc<Suppressor>>,
	/// Peers each repository is shared with.
	nodes: HashMap<String, Vec<NodeId>>,
	/// Repositories each peer shares with us.
	node_repos: HashMap<NodeId, Vec<String>>,
}

pub struct Model {
	local_id: NodeId,
	client_name: String,
	client_version: String,
	clock: Arc<LamportClock>,
	store: IndexStore,
	db: Option<Arc<IndexDb>>,
	broadcast_interval: Duration,
	pull_interval: Duration,
	max_change_kbps: u64,
	started: AtomicBool,

	rmut: RwLock<Repos>,
	smut: RwLock<HashMap<String, RepoState>>,
	pmut: RwLock<ConnectionRegistry>,
}

impl Model {
	pub fn new(local_id: NodeId, client_name: &str, client_version: &str, index_dir: &Path) -> Model {
		Model {
			local_id,
			client_name: client_name.to_string(),
			client_version: client_version.to_string(),
			clock: Arc::new(LamportClock::new()),
			store: IndexStore::new(index_dir.to_path_buf()),
			db: None,
			broadcast_interval: DEFAULT_BROADCAST_INTERVAL,
			pull_interval: DEFAULT_PULL_INTERVAL,
			max_change_kbps: DEFAULT_THRESHOLD_KBPS,
			started: AtomicBool::new(false),
			rmut: RwLock::new(Repos::default()),
			smut: RwLock::new(HashMap::new()),
			pmut: RwLock::new(ConnectionRegistry::new()),
		}
	}

	pub fn local_id(&self) -> NodeId {
		self.local_id
	}

	pub fn clock(&self) -> Arc<LamportClock> {
		Arc::clone(&self.clock)
	}

	/// Attach the cold-map backing store. Must be called before any
	/// `add_repo`.
	pub fn set_index_db(&mut self, db: Arc<IndexDb>) {
		self.db = Some(db);
	}

	pub fn set_broadcast_interval(&mut self, interval: Duration) {
		self.broadcast_interval = interval;
	}

	pub fn set_pull_interval(&mut self, interval: Duration) {
		self.pull_interval = interval;
	}

	pub fn set_max_change_kbps(&mut self, kbps: u64) {
		self.max_change_kbps = kbps;
	}

	/// Register a repository. Only valid before `start`; registering
	/// after start, with an empty id, or twice is a contract violation
	/// and panics.
	pub async fn add_repo(&self, cfg: RepoConfig) {
		if self.started.load(Ordering::SeqCst) {
			panic!("add_repo must not be called after start");
		}
		if cfg.id.is_empty() {
			panic!("add_repo: empty repository id");
		}

		let id = cfg.id.clone();
		{
			let mut repos = self.rmut.write().await;
			if repos.cfgs.contains_key(&id) {
				panic!("repository {} registered twice", id);
			}
			let set = match &self.db {
				Some(db) => FileSet::with_backing(
					&id,
					self.local_id,
					Arc::clone(&self.clock),
					Arc::clone(db),
				),
				None => FileSet::new(&id, self.local_id, Arc::clone(&self.clock)),
			};
			repos.files.insert(id.clone(), Arc::new(set));
			repos.suppressors.insert(id.clone(), Arc::new(Suppressor::new(self.max_change_kbps)));
			repos.nodes.insert(id.clone(), cfg.shared_with.clone());
			for node in &cfg.shared_with {
				repos.node_repos.entry(*node).or_default().push(id.clone());
			}
			repos.cfgs.insert(id.clone(), cfg);
		}
		self.smut.write().await.insert(id, RepoState::Idle);
	}

	/// Start the broadcast loop and the deadlock detectors. Called once
	/// all repositories are registered.
	pub fn start(self: &Arc<Self>) {
		if self.started.swap(true, Ordering::SeqCst) {
			return;
		}
		let timeout = deadlock_timeout();
		info!("model started; deadlock timeout {}s", timeout.as_secs());

		let model = Arc::clone(self);
		tokio::spawn(async move { model.broadcast_loop().await });

		for which in &[WatchedLock::Repos, WatchedLock::States, WatchedLock::Conns] {
			let model = Arc::clone(self);
			let which = *which;
			tokio::spawn(async move { model.watch_lock(which, timeout).await });
		}
	}

	// --- index persistence ---

	/// Load the saved local index of every repository, advancing the
	/// Lamport clock past every persisted version. Runs before any
	/// connection is accepted.
	pub async fn load_indexes(&self) {
		let repos: Vec<(String, PathBuf, Arc<FileSet>)> = {
			let repos = self.rmut.read().await;
			repos
				.cfgs
				.iter()
				.map(|(id, cfg)| {
					(id.clone(), cfg.directory.clone(), Arc::clone(&repos.files[id]))
				})
				.collect()
		};

		for (id, dir, set) in repos {
			let files = self.store.load(&id, &dir);
			for f in &files {
				self.clock.tick(f.version);
			}
			info!("loaded {} index entries for {}", files.len(), id);
			set.replace(NodeId::LOCAL, files);
		}
	}

	/// Write the local index of every repository to the index store.
	pub async fn save_indexes(&self) {
		let repos: Vec<(String, PathBuf, Arc<FileSet>)> = {
			let repos = self.rmut.read().await;
			repos
				.cfgs
				.iter()
				.map(|(id, cfg)| {
					(id.clone(), cfg.directory.clone(), Arc::clone(&repos.files[id]))
				})
				.collect()
		};

		for (id, dir, set) in repos {
			let mut files = Vec::new();
			set.with_have(NodeId::LOCAL, |f| {
				files.push(f.clone());
				true
			});
			if let Err(e) = self.store.save(&id, &dir, &files) {
				warn!("saving index for {}: {}", id, e);
			}
		}
	}

	// --- scanning ---

	/// Walk one repository and make the sweep authoritative for the
	/// local index. A scan error marks the repository invalid in the
	/// running configuration and is surfaced to the caller.
	pub async fn scan_repo(&self, repo: &str) -> Result<(), ModelError> {
		let (dir, ignore_perms, suppressor, set) = {
			let repos = self.rmut.read().await;
			let cfg = match repos.cfgs.get(repo) {
				Some(cfg) => cfg,
				None => return Err(ModelError::UnknownRepo(repo.to_string())),
			};
			if let Some(reason) = &cfg.invalid {
				warn!("not scanning invalid repository {}: {}", repo, reason);
				return Ok(());
			}
			(
				cfg.directory.clone(),
				cfg.ignore_perms,
				repos.suppressors.get(repo).cloned(),
				Arc::clone(repos.files.get(repo).expect("no file set for repository")),
			)
		};

		self.set_repo_state(repo, RepoState::Scanning).await;

		let walker = Walker {
			dir,
			ignore_file: DEFAULT_IGNORE_FILE.to_string(),
			block_size: BLOCK_SIZE,
			temp_namer: TempNamer::default(),
			suppressor,
			current_filer: Some(Box::new(Arc::clone(&set))),
			ignore_perms,
			clock: Arc::clone(&self.clock),
		};
		let result =
			tokio::task::spawn_blocking(move || walker.walk()).await.expect("walker panicked");

		let out = match result {
			Ok((files, ignored)) => {
				debug!("scanned {}: {} entries, {} ignored", repo, files.len(), ignored);
				set.replace_with_delete(NodeId::LOCAL, files);
				Ok(())
			}
			Err(e) => {
				warn!("scanning {}: {}; marking repository invalid", repo, e);
				let mut repos = self.rmut.write().await;
				if let Some(cfg) = repos.cfgs.get_mut(repo) {
					cfg.invalid = Some(e.to_string());
				}
				Err(ModelError::Io(e))
			}
		};

		self.set_repo_state(repo, RepoState::Idle).await;
		out
	}

	/// Scan all repositories concurrently, awaiting completion of all.
	pub async fn scan_repos(&self) {
		let ids: Vec<String> = { self.rmut.read().await.cfgs.keys().cloned().collect() };
		let results =
			futures::future::join_all(ids.iter().map(|id| self.scan_repo(id))).await;
		for (id, result) in ids.iter().zip(results) {
			if let Err(e) = result {
				warn!("scan of {} failed: {}", id, e);
			}
		}
	}

	/// Remove leftover pull temporaries from all repository directories.
	pub async fn clean_repos(&self) {
		let repos: Vec<(String, PathBuf)> = {
			let repos = self.rmut.read().await;
			repos.cfgs.iter().map(|(id, cfg)| (id.clone(), cfg.directory.clone())).collect()
		};

		futures::future::join_all(repos.into_iter().map(|(id, dir)| async move {
			self.set_repo_state(&id, RepoState::Cleaning).await;
			let result =
				tokio::task::spawn_blocking(move || clean_temp_files(&dir, &TempNamer::default()))
					.await
					.expect("cleaner panicked");
			match result {
				Ok(removed) if removed > 0 => info!("{}: removed {} temporaries", id, removed),
				Ok(_) => {}
				Err(e) => warn!("cleaning {}: {}", id, e),
			}
			self.set_repo_state(&id, RepoState::Idle).await;
		}))
		.await;
	}

	// --- pulling ---

	/// Attach a puller with `threads` worker slots. `threads == 0`
	/// means read-only (announce-only) mode. Unknown repositories are a
	/// contract violation and panic.
	pub async fn start_repo_rw(self: &Arc<Self>, repo: &str, threads: usize) {
		let cfg = { self.rmut.read().await.cfgs.get(repo).cloned() }
			.unwrap_or_else(|| panic!("start_repo_rw: unknown repository {}", repo));

		if threads == 0 {
			info!("{}: announce-only mode", repo);
			return;
		}

		info!("{}: read-write mode, {} pull workers", repo, threads);
		Puller {
			repo: repo.to_string(),
			dir: cfg.directory.clone(),
			model: Arc::clone(self),
			threads,
			temp_namer: TempNamer::default(),
			ignore_perms: cfg.ignore_perms,
			order: cfg.pull_order,
			interval: self.pull_interval,
		}
		.run();
	}

	/// Resolve every entry of the local need set in favor of this
	/// node's copy: the local version (or a synthesized deletion) gets
	/// a fresh Lamport version and wins cluster-wide on the next
	/// exchange. Administrative, for splitting split-brain conflicts.
	pub async fn override_changes(&self, repo: &str) {
		let set = match self.file_set(repo).await {
			Some(set) => set,
			None => return,
		};

		let mut need = Vec::new();
		set.with_need(NodeId::LOCAL, |g| {
			need.push(g.clone());
			true
		});

		let mut updated = Vec::new();
		for g in need {
			let cur = set.get(NodeId::LOCAL, &g.name);
			let mut f = if cur.is_empty() {
				FileInfo {
					name: g.name.clone(),
					flags: g.flags | FLAG_DELETED,
					modified: g.modified,
					version: 0,
					size: 0,
					blocks: vec![],
				}
			} else {
				cur
			};
			f.version = self.clock.tick(g.version);
			updated.push(f);
		}

		info!("{}: overriding {} remote changes", repo, updated.len());
		set.update(NodeId::LOCAL, updated);
	}

	// --- connections ---

	/// Register a live connection and kick off the handshake: cluster
	/// config, then the initial index of every shared repository in
	/// batches. Registering the same peer twice panics.
	pub async fn add_connection(self: &Arc<Self>, conn: Arc<dyn PeerConnection>) {
		{
			self.pmut.write().await.add(Arc::clone(&conn));
		}

		let model = Arc::clone(self);
		tokio::spawn(async move {
			let peer = conn.node_id();
			let msg = model.cluster_config_message(peer).await;
			if let Err(e) = conn.cluster_config(msg).await {
				warn!("cluster config to {}: {}", peer.short(), e);
				return;
			}

			let repos: Vec<String> = {
				model.rmut.read().await.node_repos.get(&peer).cloned().unwrap_or_default()
			};
			for repo in repos {
				let files = match model.file_set(&repo).await {
					Some(set) => {
						let mut files = Vec::new();
						set.with_have(NodeId::LOCAL, |f| {
							files.push(f.clone());
							true
						});
						files
					}
					None => continue,
				};
				model.send_initial_index(&conn, &repo, files).await;
			}
		});
	}

	async fn send_initial_index(
		&self,
		conn: &Arc<dyn PeerConnection>,
		repo: &str,
		files: Vec<FileInfo>,
	) {
		let peer = conn.node_id();
		debug!("sending initial index for {} to {} ({} files)", repo, peer.short(), files.len());

		if files.is_empty() {
			if let Err(e) = conn.index(repo, vec![]).await {
				warn!("initial index for {} to {}: {}", repo, peer.short(), e);
			}
			return;
		}

		// The first batch replaces the peer's view of us; the rest
		// merge into it.
		let mut first = true;
		for batch in files.chunks(INDEX_BATCH_SIZE) {
			let result = if first {
				conn.index(repo, batch.to_vec()).await
			} else {
				conn.index_update(repo, batch.to_vec()).await
			};
			first = false;
			if let Err(e) = result {
				warn!("initial index for {} to {}: {}", repo, peer.short(), e);
				return;
			}
		}
	}

	/// Tear down the connection to `node` and blank its entry in every
	/// shared file set. Idempotent.
	pub async fn close_connection(&self, node: NodeId, reason: &str) {
		let record = { self.pmut.write().await.remove(node) };
		let record = match record {
			Some(r) => r,
			None => return,
		};

		info!("disconnected from {}: {}", node.short(), reason);
		record.conn.close().await;

		let sets: Vec<Arc<FileSet>> = {
			let repos = self.rmut.read().await;
			repos
				.node_repos
				.get(&node)
				.map(|ids| ids.iter().filter_map(|id| repos.files.get(id).cloned()).collect())
				.unwrap_or_default()
		};
		for set in sets {
			set.replace(node, vec![]);
		}
	}

	pub async fn connected(&self, node: NodeId) -> bool {
		self.pmut.read().await.is_connected(node)
	}

	/// Per-connection statistics, address, client version and
	/// completion percentage.
	pub async fn connection_stats(&self) -> HashMap<NodeId, ConnectionInfo> {
		// pmut before rmut.
		let conns = self.pmut.read().await;
		let repos = self.rmut.read().await;

		let mut out = HashMap::new();
		for (node, rec) in conns.iter() {
			let stats = rec.conn.statistics();

			let mut total = 0u64;
			let mut need = 0u64;
			for (id, shared) in &repos.nodes {
				if !shared.contains(node) {
					continue;
				}
				let set = &repos.files[id];
				set.with_global(|f| {
					total += f.entry_size();
					true
				});
				set.with_need(*node, |f| {
					need += f.entry_size();
					true
				});
			}
			let completion = if total == 0 {
				100
			} else {
				(100 * total.saturating_sub(need) / total) as u8
			};

			out.insert(
				*node,
				ConnectionInfo {
					at: stats.at,
					in_bytes_total: stats.in_bytes_total,
					out_bytes_total: stats.out_bytes_total,
					address: rec.conn.address(),
					client_version: rec.client_version.clone(),
					completion,
				},
			);
		}
		out
	}

	/// Our half of the handshake for `peer`: every repository shared
	/// with it, each carrying the full list of sharing nodes.
	pub async fn cluster_config_message(&self, peer: NodeId) -> ClusterConfigMessage {
		let repos = self.rmut.read().await;
		let mut repositories = Vec::new();
		for (id, shared) in &repos.nodes {
			if !shared.contains(&peer) {
				continue;
			}
			let mut nodes = shared.clone();
			nodes.push(self.local_id);
			nodes.sort();
			nodes.dedup();
			repositories.push(RepositoryInfo {
				id: id.clone(),
				nodes: nodes
					.into_iter()
					.map(|id| NodeInfo { id, flags: FLAG_SHARE_TRUSTED })
					.collect(),
			});
		}
		repositories.sort_by(|a, b| a.id.cmp(&b.id));

		ClusterConfigMessage {
			client_name: self.client_name.clone(),
			client_version: self.client_version.clone(),
			repositories,
		}
	}

	// --- puller support ---

	/// Issue a byte-range read to a connected peer.
	pub async fn request_global(
		&self,
		node: NodeId,
		repo: &str,
		name: &str,
		offset: u64,
		size: u32,
	) -> Result<Vec<u8>, ModelError> {
		let conn = { self.pmut.read().await.get(node) }.ok_or(ModelError::ConnectionClosed)?;
		debug!("requesting {}/{} o={} s={} from {}", repo, name, offset, size, node.short());
		conn.request(repo, name, offset, size).await
	}

	/// Nodes that hold the winning version of `name` and are currently
	/// connected.
	pub async fn availability_connected(&self, repo: &str, name: &str) -> Vec<NodeId> {
		// pmut before rmut.
		let connected: Vec<NodeId> = {
			let conns = self.pmut.read().await;
			conns.iter().map(|(n, _)| *n).collect()
		};
		let set = match self.file_set(repo).await {
			Some(set) => set,
			None => return vec![],
		};
		set.availability(name).into_iter().filter(|n| connected.contains(n)).collect()
	}

	/// The puller's commit callback: adopt a reconstructed (or applied)
	/// entry into the local index, version taken from the winner.
	pub async fn update_local(&self, repo: &str, file: FileInfo) {
		if let Some(set) = self.file_set(repo).await {
			set.update(NodeId::LOCAL, vec![file]);
		}
	}

	/// The local index entry for `name` (the CurrentFiler contract).
	pub async fn current_repo_file(&self, repo: &str, name: &str) -> FileInfo {
		match self.file_set(repo).await {
			Some(set) => set.get(NodeId::LOCAL, name),
			None => FileInfo::default(),
		}
	}

	// --- administrative queries ---

	pub async fn file_set(&self, repo: &str) -> Option<Arc<FileSet>> {
		self.rmut.read().await.files.get(repo).cloned()
	}

	pub async fn global_size(&self, repo: &str) -> Counts {
		let mut counts = Counts::default();
		if let Some(set) = self.file_set(repo).await {
			set.with_global(|f| {
				counts.add(f);
				true
			});
		}
		counts
	}

	pub async fn local_size(&self, repo: &str) -> Counts {
		let mut counts = Counts::default();
		if let Some(set) = self.file_set(repo).await {
			set.with_have(NodeId::LOCAL, |f| {
				counts.add(f);
				true
			});
		}
		counts
	}

	pub async fn need_size(&self, repo: &str) -> Counts {
		let mut counts = Counts::default();
		if let Some(set) = self.file_set(repo).await {
			set.with_need(NodeId::LOCAL, |f| {
				counts.add(f);
				true
			});
		}
		counts
	}

	/// The files this node must fetch for `repo`, in name order.
	pub async fn need_files_repo(&self, repo: &str) -> Vec<FileInfo> {
		let mut need = Vec::new();
		if let Some(set) = self.file_set(repo).await {
			set.with_need(NodeId::LOCAL, |f| {
				need.push(f.clone());
				true
			});
		}
		need
	}

	pub async fn state(&self, repo: &str) -> RepoState {
		self.smut.read().await.get(repo).copied().unwrap_or(RepoState::Idle)
	}

	pub(crate) async fn set_repo_state(&self, repo: &str, state: RepoState) {
		self.smut.write().await.insert(repo.to_string(), state);
	}

	/// Sum of the change counters of every node sharing `repo`.
	/// Strictly increases whenever any node's map changes.
	pub async fn version(&self, repo: &str) -> u64 {
		let repos = self.rmut.read().await;
		let set = match repos.files.get(repo) {
			Some(set) => set,
			None => return 0,
		};
		let mut version = set.changes(NodeId::LOCAL);
		if let Some(nodes) = repos.nodes.get(repo) {
			for node in nodes {
				version += set.changes(*node);
			}
		}
		version
	}

	// --- background tasks ---

	async fn broadcast_loop(&self) {
		let mut remembered: HashMap<String, u64> = HashMap::new();
		loop {
			tokio::time::sleep(self.broadcast_interval).await;

			// pmut before rmut; both dropped before any send.
			let conns: HashMap<NodeId, Arc<dyn PeerConnection>> = {
				let conns = self.pmut.read().await;
				conns.iter().map(|(n, rec)| (*n, Arc::clone(&rec.conn))).collect()
			};

			let mut sends: Vec<(String, Vec<FileInfo>, Vec<Arc<dyn PeerConnection>>)> = Vec::new();
			{
				let repos = self.rmut.read().await;
				for (id, set) in &repos.files {
					let changes = set.changes(NodeId::LOCAL);
					if remembered.get(id) == Some(&changes) {
						continue;
					}
					remembered.insert(id.clone(), changes);

					let peers: Vec<Arc<dyn PeerConnection>> = repos
						.nodes
						.get(id)
						.map(|ns| ns.iter().filter_map(|n| conns.get(n).cloned()).collect())
						.unwrap_or_default();
					if peers.is_empty() {
						continue;
					}

					let mut files = Vec::new();
					set.with_have(NodeId::LOCAL, |f| {
						files.push(f.clone());
						true
					});
					sends.push((id.clone(), files, peers));
				}
			}

			let mut tasks = Vec::new();
			for (repo, files, peers) in sends {
				for conn in peers {
					let repo = repo.clone();
					let files = files.clone();
					tasks.push(tokio::spawn(async move {
						debug!(
							"broadcasting index for {} to {} ({} files)",
							repo,
							conn.node_id().short(),
							files.len()
						);
						if let Err(e) = conn.index(&repo, files).await {
							warn!("index to {}: {}", conn.node_id().short(), e);
						}
					}));
				}
			}
			for task in tasks {
				let _ = task.await;
			}
		}
	}

	async fn watch_lock(&self, which: WatchedLock, timeout: Duration) {
		loop {
			tokio::time::sleep(timeout).await;
			let acquired = match which {
				WatchedLock::Repos => {
					tokio::time::timeout(timeout, self.rmut.write()).await.map(drop).is_ok()
				}
				WatchedLock::States => {
					tokio::time::timeout(timeout, self.smut.write()).await.map(drop).is_ok()
				}
				WatchedLock::Conns => {
					tokio::time::timeout(timeout, self.pmut.write()).await.map(drop).is_ok()
				}
			};
			if !acquired {
				panic!("deadlock detected: {} lock wedged for {}s", which.name(), timeout.as_secs());
			}
		}
	}

	async fn repo_shared_with(&self, repo: &str, node: NodeId) -> bool {
		let repos = self.rmut.read().await;
		repos.nodes.get(repo).map(|ns| ns.contains(&node)).unwrap_or(false)
	}
}

#[derive(Clone, Copy)]
enum WatchedLock {
	Repos,
	States,
	Conns,
}

impl WatchedLock {
	fn name(&self) -> &'static str {
		match self {
			WatchedLock::Repos => "repository",
			WatchedLock::States => "state",
			WatchedLock::Conns => "connection",
		}
	}
}

/// Deadlock detector period and limit; `STDEADLOCKTIMEOUT` (seconds)
/// overrides the default.
fn deadlock_timeout() -> Duration {
	match std::env::var("STDEADLOCKTIMEOUT") {
		Ok(v) => match v.parse::<u64>() {
			Ok(secs) if secs > 0 => Duration::from_secs(secs),
			_ => {
				warn!("ignoring invalid STDEADLOCKTIMEOUT {:?}", v);
				DEFAULT_DEADLOCK_TIMEOUT
			}
		},
		Err(_) => DEFAULT_DEADLOCK_TIMEOUT,
	}
}

#[async_trait]
impl MessageHandler for Model {
	/// Full index from a peer; replaces its map wholesale. Indexes for
	/// repositories the peer is not authorized for are logged and
	/// dropped.
	async fn index(&self, node: NodeId, repo: &str, files: Vec<FileInfo>) {
		if !self.repo_shared_with(repo, node).await {
			warn!("unexpected index for {} from {}; dropping", repo, node.short());
			return;
		}
		for f in &files {
			self.clock.tick(f.version);
		}
		debug!("index from {}: {} files in {}", node.short(), files.len(), repo);
		let set =
			self.file_set(repo).await.expect("no file set for shared repository");
		set.replace(node, files);
	}

	async fn index_update(&self, node: NodeId, repo: &str, files: Vec<FileInfo>) {
		if !self.repo_shared_with(repo, node).await {
			warn!("unexpected index update for {} from {}; dropping", repo, node.short());
			return;
		}
		for f in &files {
			self.clock.tick(f.version);
		}
		debug!("index update from {}: {} files in {}", node.short(), files.len(), repo);
		let set =
			self.file_set(repo).await.expect("no file set for shared repository");
		set.update(node, files);
	}

	/// Compare the peer's announced cluster against ours; disagreement
	/// closes the connection, differing client name and version are
	/// informational.
	async fn cluster_config(&self, node: NodeId, msg: ClusterConfigMessage) {
		let mine = self.cluster_config_message(node).await;
		match compare_cluster_config(&mine, &msg) {
			Ok(()) => {
				info!(
					"cluster config from {} ({} {})",
					node.short(),
					msg.client_name,
					msg.client_version
				);
				self.pmut.write().await.set_client_info(node, &msg.client_name, &msg.client_version);
			}
			Err(e) => {
				warn!("{}: {}", node.short(), e);
				self.close_connection(node, &e.to_string()).await;
			}
		}
	}

	/// Serve a byte range of a local file. The file is opened, read and
	/// closed on every call; disk errors are surfaced verbatim.
	async fn request(
		&self,
		node: NodeId,
		repo: &str,
		name: &str,
		offset: u64,
		size: u32,
	) -> Result<Vec<u8>, ModelError> {
		let (dir, set) = {
			let repos = self.rmut.read().await;
			let cfg = match repos.cfgs.get(repo) {
				Some(cfg) => cfg,
				None => return Err(ModelError::NoSuchFile),
			};
			if !repos.nodes.get(repo).map(|ns| ns.contains(&node)).unwrap_or(false) {
				warn!("request for unshared repository {} from {}", repo, node.short());
				return Err(ModelError::NotShared { repo: repo.to_string(), node });
			}
			(cfg.directory.clone(), Arc::clone(&repos.files[repo]))
		};

		// Names are repository-relative by contract; anything else is
		// treated as nonexistent.
		if name.is_empty() || name.starts_with('/') || name.split('/').any(|c| c == "..") {
			return Err(ModelError::NoSuchFile);
		}

		let file = set.get(NodeId::LOCAL, name);
		if file.is_empty() {
			return Err(ModelError::NoSuchFile);
		}
		if file.is_invalid() || file.is_deleted() {
			return Err(ModelError::Invalid);
		}
		if offset > file.size {
			return Err(ModelError::NoSuchFile);
		}

		debug!("request from {}: {}/{} o={} s={}", node.short(), repo, name, offset, size);
		let mut fd = tokio::fs::File::open(dir.join(name)).await?;
		fd.seek(SeekFrom::Start(offset)).await?;
		let mut buf = vec![0u8; size as usize];
		fd.read_exact(&mut buf).await?;
		Ok(buf)
	}

	async fn close(&self, node: NodeId, reason: String) {
		self.close_connection(node, &reason).await;
	}
}

// vim: ts=4
