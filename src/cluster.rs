//! Cluster configuration handshake
//!
//! Immediately after connecting, both sides announce which
//! repositories they share and with whom. The two views must agree on
//! the set of shared repository ids and, per repository, on the set of
//! sharing node ids; any disagreement closes the connection. Client
//! name and version are informational only.

use std::collections::BTreeSet;

use crate::error::ModelError;
use crate::types::NodeId;

/// Node participates in the repository with full trust.
pub const FLAG_SHARE_TRUSTED: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterConfigMessage {
	pub client_name: String,
	pub client_version: String,
	pub repositories: Vec<RepositoryInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryInfo {
	pub id: String,
	pub nodes: Vec<NodeInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
	pub id: NodeId,
	pub flags: u32,
}

/// Compare our view of the cluster against a peer's announcement.
///
/// Both sides run the same comparison, so a mismatch is raised at both
/// ends of the connection.
pub fn compare_cluster_config(
	mine: &ClusterConfigMessage,
	theirs: &ClusterConfigMessage,
) -> Result<(), ModelError> {
	let my_repos: BTreeSet<&str> = mine.repositories.iter().map(|r| r.id.as_str()).collect();
	let their_repos: BTreeSet<&str> = theirs.repositories.iter().map(|r| r.id.as_str()).collect();

	for repo in my_repos.difference(&their_repos) {
		return Err(ModelError::ClusterMismatch {
			reason: format!("peer is missing repository {}", repo),
		});
	}
	for repo in their_repos.difference(&my_repos) {
		return Err(ModelError::ClusterMismatch {
			reason: format!("peer announces repository {} we do not share", repo),
		});
	}

	for my_repo in &mine.repositories {
		let their_repo = theirs
			.repositories
			.iter()
			.find(|r| r.id == my_repo.id)
			.expect("repo id sets already compared");

		let my_nodes: BTreeSet<NodeId> = my_repo.nodes.iter().map(|n| n.id).collect();
		let their_nodes: BTreeSet<NodeId> = their_repo.nodes.iter().map(|n| n.id).collect();

		for node in my_nodes.difference(&their_nodes) {
			return Err(ModelError::ClusterMismatch {
				reason: format!(
					"peer does not share repository {} with node {}",
					my_repo.id,
					node.short()
				),
			});
		}
		for node in their_nodes.difference(&my_nodes) {
			return Err(ModelError::ClusterMismatch {
				reason: format!(
					"peer shares repository {} with unexpected node {}",
					my_repo.id,
					node.short()
				),
			});
		}
	}

	Ok(())
}


// vim: ts=4
