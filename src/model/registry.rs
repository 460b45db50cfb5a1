//! Live connection registry
//!
//! One record per connected peer, keyed by node id. Registering the
//! same peer twice is a contract violation by the surrounding code and
//! panics; removal is idempotent.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

use crate::protocol::PeerConnection;
use crate::types::NodeId;

pub struct ConnectionRecord {
	pub conn: Arc<dyn PeerConnection>,
	pub client_name: String,
	pub client_version: String,
}

/// Per-connection facts reported on the administrative surface.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
	pub at: SystemTime,
	pub in_bytes_total: u64,
	pub out_bytes_total: u64,
	pub address: String,
	pub client_version: String,
	/// Percentage of the global view this peer already has.
	pub completion: u8,
}

#[derive(Default)]
pub struct ConnectionRegistry {
	conns: HashMap<NodeId, ConnectionRecord>,
}

impl ConnectionRegistry {
	pub fn new() -> Self {
		ConnectionRegistry { conns: HashMap::new() }
	}

	pub fn add(&mut self, conn: Arc<dyn PeerConnection>) {
		let node = conn.node_id();
		if self.conns.contains_key(&node) {
			panic!("connection to {} registered twice", node);
		}
		self.conns.insert(
			node,
			ConnectionRecord { conn, client_name: String::new(), client_version: String::new() },
		);
	}

	pub fn remove(&mut self, node: NodeId) -> Option<ConnectionRecord> {
		self.conns.remove(&node)
	}

	pub fn get(&self, node: NodeId) -> Option<Arc<dyn PeerConnection>> {
		self.conns.get(&node).map(|rec| Arc::clone(&rec.conn))
	}

	pub fn is_connected(&self, node: NodeId) -> bool {
		self.conns.contains_key(&node)
	}

	pub fn set_client_info(&mut self, node: NodeId, name: &str, version: &str) {
		if let Some(rec) = self.conns.get_mut(&node) {
			rec.client_name = name.to_string();
			rec.client_version = version.to_string();
		}
	}

	pub fn iter(&self) -> impl Iterator<Item = (&NodeId, &ConnectionRecord)> {
		self.conns.iter()
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::cluster::ClusterConfigMessage;
	use crate::error::ModelError;
	use crate::protocol::Statistics;
	use crate::types::FileInfo;
	use async_trait::async_trait;

	struct FakeConnection(NodeId);

	#[async_trait]
	impl PeerConnection for FakeConnection {
		fn node_id(&self) -> NodeId {
			self.0
		}

		fn address(&self) -> String {
			"fake".into()
		}

		async fn index(&self, _repo: &str, _files: Vec<FileInfo>) -> Result<(), ModelError> {
			Ok(())
		}

		async fn index_update(&self, _repo: &str, _files: Vec<FileInfo>) -> Result<(), ModelError> {
			Ok(())
		}

		async fn request(
			&self,
			_repo: &str,
			_name: &str,
			_offset: u64,
			_size: u32,
		) -> Result<Vec<u8>, ModelError> {
			Ok(vec![])
		}

		async fn cluster_config(&self, _msg: ClusterConfigMessage) -> Result<(), ModelError> {
			Ok(())
		}

		async fn close(&self) {}

		fn statistics(&self) -> Statistics {
			Statistics::default()
		}
	}

	#[test]
	fn test_add_remove() {
		let node = NodeId([1; 32]);
		let mut reg = ConnectionRegistry::new();
		assert!(!reg.is_connected(node));

		reg.add(Arc::new(FakeConnection(node)));
		assert!(reg.is_connected(node));
		assert!(reg.get(node).is_some());

		assert!(reg.remove(node).is_some());
		assert!(reg.remove(node).is_none());
		assert!(!reg.is_connected(node));
	}

	#[test]
	#[should_panic(expected = "registered twice")]
	fn test_double_add_panics() {
		let node = NodeId([1; 32]);
		let mut reg = ConnectionRegistry::new();
		reg.add(Arc::new(FakeConnection(node)));
		reg.add(Arc::new(FakeConnection(node)));
	}

	#[test]
	fn test_client_info() {
		let node = NodeId([1; 32]);
		let mut reg = ConnectionRegistry::new();
		reg.add(Arc::new(FakeConnection(node)));
		reg.set_client_info(node, "meshsync", "0.1.0");
		let (_, rec) = reg.iter().next().unwrap();
		assert_eq!(rec.client_name, "meshsync");
		assert_eq!(rec.client_version, "0.1.0");
	}
}

// vim: ts=4
