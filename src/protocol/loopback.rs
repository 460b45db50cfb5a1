//! In-process connection pair
//!
//! Connects two message handlers living in the same process, with the
//! same contract as a real wire connection: calls arrive at the remote
//! handler in issue order, byte counters are maintained, and closing
//! either side closes both. Used by the integration tests to wire two
//! models together over real directories.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use super::{MessageHandler, PeerConnection, Statistics};
use crate::cluster::ClusterConfigMessage;
use crate::error::ModelError;
use crate::types::{FileInfo, NodeId};

pub struct LoopbackConnection {
	/// Id this end presents to the remote handler.
	from: NodeId,
	/// Id of the peer this connection reaches.
	to: NodeId,
	handler: Arc<dyn MessageHandler>,
	/// Shared between both directions; closing one side closes the link.
	closed: Arc<AtomicBool>,
	established: SystemTime,
	in_bytes: AtomicU64,
	out_bytes: AtomicU64,
}

/// Build a connected pair: the first handle reaches `b` and is handed
/// to `a`'s model, the second reaches `a` and is handed to `b`'s.
pub fn loopback_pair(
	a: NodeId,
	a_handler: Arc<dyn MessageHandler>,
	b: NodeId,
	b_handler: Arc<dyn MessageHandler>,
) -> (Arc<LoopbackConnection>, Arc<LoopbackConnection>) {
	let closed = Arc::new(AtomicBool::new(false));
	let now = SystemTime::now();
	let for_a = Arc::new(LoopbackConnection {
		from: a,
		to: b,
		handler: b_handler,
		closed: Arc::clone(&closed),
		established: now,
		in_bytes: AtomicU64::new(0),
		out_bytes: AtomicU64::new(0),
	});
	let for_b = Arc::new(LoopbackConnection {
		from: b,
		to: a,
		handler: a_handler,
		closed,
		established: now,
		in_bytes: AtomicU64::new(0),
		out_bytes: AtomicU64::new(0),
	});
	(for_a, for_b)
}

impl LoopbackConnection {
	fn check_open(&self) -> Result<(), ModelError> {
		if self.closed.load(Ordering::SeqCst) {
			Err(ModelError::ConnectionClosed)
		} else {
			Ok(())
		}
	}

	fn count_out(&self, files: &[FileInfo]) {
		let bytes = serde_json::to_vec(files).map(|v| v.len() as u64).unwrap_or(0);
		self.out_bytes.fetch_add(bytes, Ordering::Relaxed);
	}
}

#[async_trait]
impl PeerConnection for LoopbackConnection {
	fn node_id(&self) -> NodeId {
		self.to
	}

	fn address(&self) -> String {
		format!("loopback/{}", self.to.short())
	}

	async fn index(&self, repo: &str, files: Vec<FileInfo>) -> Result<(), ModelError> {
		self.check_open()?;
		self.count_out(&files);
		self.handler.index(self.from, repo, files).await;
		Ok(())
	}

	async fn index_update(&self, repo: &str, files: Vec<FileInfo>) -> Result<(), ModelError> {
		self.check_open()?;
		self.count_out(&files);
		self.handler.index_update(self.from, repo, files).await;
		Ok(())
	}

	async fn request(
		&self,
		repo: &str,
		name: &str,
		offset: u64,
		size: u32,
	) -> Result<Vec<u8>, ModelError> {
		self.check_open()?;
		let data = self.handler.request(self.from, repo, name, offset, size).await?;
		self.in_bytes.fetch_add(data.len() as u64, Ordering::Relaxed);
		Ok(data)
	}

	async fn cluster_config(&self, msg: ClusterConfigMessage) -> Result<(), ModelError> {
		self.check_open()?;
		self.handler.cluster_config(self.from, msg).await;
		Ok(())
	}

	async fn close(&self) {
		if self.closed.swap(true, Ordering::SeqCst) {
			return;
		}
		self.handler.close(self.from, "connection closed by peer".to_string()).await;
	}

	fn statistics(&self) -> Statistics {
		Statistics {
			at: self.established,
			in_bytes_total: self.in_bytes.load(Ordering::Relaxed),
			out_bytes_total: self.out_bytes.load(Ordering::Relaxed),
		}
	}
}

// vim: ts=4
