//! Peer protocol contract
//!
//! The wire framing and encryption live outside this crate; these
//! traits are the seam. A `PeerConnection` is the handle the model uses
//! to issue calls to one peer; a `MessageHandler` is what the protocol
//! layer invokes when frames arrive. Frames per connection and
//! direction are delivered in send order; across peers no ordering is
//! guaranteed.

pub mod loopback;

use async_trait::async_trait;
use std::time::SystemTime;

use crate::cluster::ClusterConfigMessage;
use crate::error::ModelError;
use crate::types::{FileInfo, NodeId};

/// Transfer counters for one connection.
#[derive(Debug, Clone, Copy)]
pub struct Statistics {
	pub at: SystemTime,
	pub in_bytes_total: u64,
	pub out_bytes_total: u64,
}

impl Default for Statistics {
	fn default() -> Self {
		Statistics { at: SystemTime::UNIX_EPOCH, in_bytes_total: 0, out_bytes_total: 0 }
	}
}

/// Outbound handle to one peer.
#[async_trait]
pub trait PeerConnection: Send + Sync {
	/// The remote peer's node id.
	fn node_id(&self) -> NodeId;

	fn address(&self) -> String;

	/// Send a full index for `repo`; replaces the peer's view of us.
	async fn index(&self, repo: &str, files: Vec<FileInfo>) -> Result<(), ModelError>;

	/// Send an incremental index; merged into the peer's view of us.
	async fn index_update(&self, repo: &str, files: Vec<FileInfo>) -> Result<(), ModelError>;

	/// Read a byte range of one of the peer's files.
	async fn request(
		&self,
		repo: &str,
		name: &str,
		offset: u64,
		size: u32,
	) -> Result<Vec<u8>, ModelError>;

	async fn cluster_config(&self, msg: ClusterConfigMessage) -> Result<(), ModelError>;

	/// Tear the link down. Idempotent.
	async fn close(&self);

	fn statistics(&self) -> Statistics;
}

/// Callbacks consumed by the protocol layer; implemented by the model.
#[async_trait]
pub trait MessageHandler: Send + Sync {
	async fn index(&self, node: NodeId, repo: &str, files: Vec<FileInfo>);

	async fn index_update(&self, node: NodeId, repo: &str, files: Vec<FileInfo>);

	async fn cluster_config(&self, node: NodeId, msg: ClusterConfigMessage);

	async fn request(
		&self,
		node: NodeId,
		repo: &str,
		name: &str,
		offset: u64,
		size: u32,
	) -> Result<Vec<u8>, ModelError>;

	async fn close(&self, node: NodeId, reason: String);
}

// vim: ts=4
