//! Two-node synchronization scenarios
//!
//! Each test wires two models together with a loopback connection over
//! real temporary directories: index exchange, size accounting, delete
//! propagation, conflict resolution with operator override, cluster
//! config mismatch and block request edge cases.

use std::fs;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use meshsync::config::RepoConfig;
use meshsync::error::ModelError;
use meshsync::model::Model;
use meshsync::protocol::loopback::loopback_pair;
use meshsync::protocol::MessageHandler;
use meshsync::types::{FileInfo, NodeId};

const A: NodeId = NodeId([0x11; 32]);
const B: NodeId = NodeId([0x22; 32]);
const C: NodeId = NodeId([0x33; 32]);

struct Node {
	model: Arc<Model>,
	dir: TempDir,
	_index_dir: TempDir,
}

async fn make_node(id: NodeId, shared_with: Vec<NodeId>) -> Node {
	let dir = TempDir::new().unwrap();
	let index_dir = TempDir::new().unwrap();

	let mut model = Model::new(id, "meshsync", "test", index_dir.path());
	model.set_broadcast_interval(Duration::from_millis(100));
	let model = Arc::new(model);

	model
		.add_repo(RepoConfig {
			id: "r".to_string(),
			directory: dir.path().to_path_buf(),
			shared_with,
			..Default::default()
		})
		.await;

	Node { model, dir, _index_dir: index_dir }
}

async fn connect(a: &Node, b: &Node) {
	let (for_a, for_b) = loopback_pair(
		a.model.local_id(),
		Arc::clone(&a.model) as Arc<dyn MessageHandler>,
		b.model.local_id(),
		Arc::clone(&b.model) as Arc<dyn MessageHandler>,
	);
	a.model.add_connection(for_a).await;
	b.model.add_connection(for_b).await;
}

/// Poll `cond` until it holds or ten seconds pass.
async fn eventually<F, Fut>(mut cond: F) -> bool
where
	F: FnMut() -> Fut,
	Fut: Future<Output = bool>,
{
	let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
	loop {
		if cond().await {
			return true;
		}
		if tokio::time::Instant::now() > deadline {
			return false;
		}
		tokio::time::sleep(Duration::from_millis(50)).await;
	}
}

#[tokio::test]
async fn test_one_way_sync_accounting() {
	let a = make_node(A, vec![B]).await;
	let b = make_node(B, vec![A]).await;

	fs::write(a.dir.path().join("f1"), vec![7u8; 100]).unwrap();
	fs::create_dir(a.dir.path().join("d1")).unwrap();
	fs::write(a.dir.path().join("f2"), b"").unwrap();

	a.model.scan_repo("r").await.unwrap();
	let local = a.model.local_size("r").await;
	assert_eq!(local.files, 3);
	assert_eq!(local.deleted, 0);
	assert_eq!(local.bytes, 356, "100 B file + directory + empty file");

	connect(&a, &b).await;

	assert!(
		eventually(|| async {
			let need = b.model.need_size("r").await;
			need.files + need.deleted == 3 && need.bytes == 356
		})
		.await,
		"peer should need the whole initial index"
	);

	// The announcing side needs nothing.
	let need = a.model.need_size("r").await;
	assert_eq!(need.files + need.deleted, 0);
}

#[tokio::test]
async fn test_delete_propagation() {
	let a = make_node(A, vec![B]).await;
	let b = make_node(B, vec![A]).await;

	fs::write(a.dir.path().join("f1"), vec![7u8; 100]).unwrap();
	a.model.scan_repo("r").await.unwrap();
	connect(&a, &b).await;
	a.model.start();

	assert!(
		eventually(|| async { b.model.need_size("r").await.bytes == 100 }).await,
		"peer should need the file first"
	);

	// B reconstructs the file (the puller's job) and adopts the entry;
	// without a local copy the later deletion would not be pending
	// work for it.
	let adopted = b.model.file_set("r").await.unwrap().get_global("f1");
	b.model.update_local("r", adopted).await;
	assert_eq!(b.model.need_size("r").await.bytes, 0);

	fs::remove_file(a.dir.path().join("f1")).unwrap();
	a.model.scan_repo("r").await.unwrap();

	let tomb = a.model.file_set("r").await.unwrap().get(NodeId::LOCAL, "f1");
	assert!(tomb.is_deleted());
	assert!(tomb.version > 0);

	assert!(
		eventually(|| async {
			let need = b.model.need_size("r").await;
			need.deleted == 1 && need.files == 0 && need.bytes == 128
		})
		.await,
		"the deletion itself should become pending work"
	);

	// The peer applies the deletion locally and adopts the tombstone;
	// its need drains.
	let tomb = b.model.file_set("r").await.unwrap().get_global("f1");
	assert!(tomb.is_deleted());
	b.model.update_local("r", tomb).await;

	let need = b.model.need_size("r").await;
	assert_eq!(need.files + need.deleted, 0);
	assert_eq!(need.bytes, 0);
}

#[tokio::test]
async fn test_conflict_resolution_and_override() {
	let a = make_node(A, vec![B]).await;
	let b = make_node(B, vec![A]).await;

	// Both sides modified f3 while disconnected: equal version, the
	// node id decides.
	let ours = FileInfo { name: "f3".into(), version: 5, modified: 100, size: 1, ..Default::default() };
	let theirs = FileInfo { name: "f3".into(), version: 5, modified: 200, size: 2, ..Default::default() };
	a.model.update_local("r", ours).await;
	b.model.update_local("r", theirs).await;

	connect(&a, &b).await;

	assert!(
		eventually(|| async {
			a.model.file_set("r").await.unwrap().get_global("f3").size == 2
		})
		.await,
		"B's copy should win the tiebreak on A"
	);
	assert_eq!(b.model.file_set("r").await.unwrap().get_global("f3").size, 2);

	// The operator declares A's repository authoritative.
	a.model.override_changes("r").await;

	let g = a.model.file_set("r").await.unwrap().get_global("f3");
	assert_eq!(g.size, 1, "the local copy wins after override");
	assert!(g.version > 5);

	a.model.start();
	assert!(
		eventually(|| async {
			b.model.file_set("r").await.unwrap().get_global("f3").size == 1
		})
		.await,
		"the overridden copy should win on B after the next broadcast"
	);
}

#[tokio::test]
async fn test_cluster_mismatch_closes_connection() {
	// A shares r with {B, C}; B shares it with {A} only.
	let a = make_node(A, vec![B, C]).await;
	let b = make_node(B, vec![A]).await;

	connect(&a, &b).await;

	assert!(
		eventually(|| async {
			!a.model.connected(B).await && !b.model.connected(A).await
		})
		.await,
		"both sides should drop the connection on a cluster mismatch"
	);
}

#[tokio::test]
async fn test_matching_cluster_stays_connected() {
	let a = make_node(A, vec![B]).await;
	let b = make_node(B, vec![A]).await;

	connect(&a, &b).await;
	tokio::time::sleep(Duration::from_millis(300)).await;

	assert!(a.model.connected(B).await);
	assert!(b.model.connected(A).await);

	let stats = a.model.connection_stats().await;
	assert!(stats.contains_key(&B));
	assert_eq!(stats[&B].client_version, "test");
}

#[tokio::test]
async fn test_request_serves_byte_ranges() {
	let a = make_node(A, vec![B]).await;
	let payload: Vec<u8> = (0..100u8).collect();
	fs::write(a.dir.path().join("f1"), &payload).unwrap();
	a.model.scan_repo("r").await.unwrap();

	let data = a.model.request(B, "r", "f1", 10, 20).await.unwrap();
	assert_eq!(data, payload[10..30].to_vec());

	let whole = a.model.request(B, "r", "f1", 0, 100).await.unwrap();
	assert_eq!(whole, payload);
}

#[tokio::test]
async fn test_request_out_of_bounds_is_no_such_file() {
	let a = make_node(A, vec![B]).await;
	fs::write(a.dir.path().join("f1"), vec![0u8; 100]).unwrap();
	a.model.scan_repo("r").await.unwrap();

	match a.model.request(B, "r", "f1", 1000, 10).await {
		Err(ModelError::NoSuchFile) => {}
		other => panic!("expected NoSuchFile, got {:?}", other.map(|d| d.len())),
	}
}

#[tokio::test]
async fn test_request_error_mapping() {
	let a = make_node(A, vec![B]).await;
	fs::write(a.dir.path().join("f1"), vec![0u8; 10]).unwrap();
	a.model.scan_repo("r").await.unwrap();

	// Unknown repository.
	assert!(matches!(
		a.model.request(B, "nope", "f1", 0, 1).await,
		Err(ModelError::NoSuchFile)
	));

	// Peer the repository is not shared with.
	assert!(matches!(
		a.model.request(C, "r", "f1", 0, 1).await,
		Err(ModelError::NotShared { .. })
	));

	// Unindexed name.
	assert!(matches!(
		a.model.request(B, "r", "missing", 0, 1).await,
		Err(ModelError::NoSuchFile)
	));

	// Path escape attempts read as nonexistent names.
	assert!(matches!(
		a.model.request(B, "r", "../secret", 0, 1).await,
		Err(ModelError::NoSuchFile)
	));

	// Deleted entries are invalid, not missing.
	fs::remove_file(a.dir.path().join("f1")).unwrap();
	a.model.scan_repo("r").await.unwrap();
	assert!(matches!(a.model.request(B, "r", "f1", 0, 1).await, Err(ModelError::Invalid)));
}

#[tokio::test]
async fn test_close_blanks_peer_maps_and_is_idempotent() {
	let a = make_node(A, vec![B]).await;
	let b = make_node(B, vec![A]).await;

	fs::write(b.dir.path().join("f"), vec![1u8; 10]).unwrap();
	b.model.scan_repo("r").await.unwrap();
	connect(&a, &b).await;

	assert!(
		eventually(|| async { !a.model.file_set("r").await.unwrap().get(B, "f").is_empty() })
			.await
	);

	a.model.close_connection(B, "test teardown").await;
	assert!(!a.model.connected(B).await);
	assert!(a.model.file_set("r").await.unwrap().get(B, "f").is_empty());
	assert!(a.model.file_set("r").await.unwrap().get_global("f").is_empty());

	// A second close of the same peer is a no-op.
	a.model.close_connection(B, "again").await;
	assert!(!a.model.connected(B).await);
}

#[tokio::test]
async fn test_version_is_monotonic() {
	let a = make_node(A, vec![B]).await;
	let mut last = a.model.version("r").await;

	fs::write(a.dir.path().join("f"), vec![1u8; 10]).unwrap();
	a.model.scan_repo("r").await.unwrap();
	let v = a.model.version("r").await;
	assert!(v > last);
	last = v;

	a.model
		.file_set("r")
		.await
		.unwrap()
		.update(B, vec![FileInfo { name: "g".into(), version: 9, ..Default::default() }]);
	let v = a.model.version("r").await;
	assert!(v > last);
	last = v;

	a.model.override_changes("r").await;
	let v = a.model.version("r").await;
	assert!(v > last);
}

#[tokio::test]
async fn test_index_persistence_across_restart() {
	let dir = TempDir::new().unwrap();
	let index_dir = TempDir::new().unwrap();
	fs::write(dir.path().join("f1"), vec![7u8; 100]).unwrap();

	let repo_cfg = RepoConfig {
		id: "r".to_string(),
		directory: dir.path().to_path_buf(),
		shared_with: vec![B],
		..Default::default()
	};

	let first = Arc::new(Model::new(A, "meshsync", "test", index_dir.path()));
	first.add_repo(repo_cfg.clone()).await;
	first.scan_repo("r").await.unwrap();
	let before = local_entry(&first, "f1").await;
	first.save_indexes().await;
	drop(first);

	let second = Arc::new(Model::new(A, "meshsync", "test", index_dir.path()));
	second.add_repo(repo_cfg).await;
	second.load_indexes().await;

	let after = local_entry(&second, "f1").await;
	assert_eq!(before, after, "the decoded snapshot is installed as-is");

	// The clock was advanced past every persisted version: a rescan of
	// an unchanged tree must not regress or re-tick anything.
	second.scan_repo("r").await.unwrap();
	assert_eq!(local_entry(&second, "f1").await.version, after.version);
}

async fn local_entry(model: &Arc<Model>, name: &str) -> FileInfo {
	model.file_set("r").await.unwrap().get(NodeId::LOCAL, name)
}

// vim: ts=4
