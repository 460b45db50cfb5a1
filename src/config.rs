//! Node and repository configuration
//!
//! Loaded once at startup from a TOML file. Repositories may only be
//! added to the model before it starts, so the configuration is
//! effectively immutable for the lifetime of the process; the only
//! runtime mutation is marking a repository invalid after a failed
//! scan.

use serde::{Deserialize, Serialize};
use std::error::Error;
use std::path::{Path, PathBuf};

use crate::types::NodeId;

/// Order in which the puller works through the need set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PullOrder {
	Alphabetic,
	SmallestFirst,
	LargestFirst,
	NewestFirst,
	OldestFirst,
}

impl Default for PullOrder {
	fn default() -> Self {
		PullOrder::Alphabetic
	}
}

/// One shared directory tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RepoConfig {
	/// Repository id, unique per process. Must not be empty.
	pub id: String,

	/// Root directory of the tree.
	pub directory: PathBuf,

	/// Do not replicate or restore permission bits.
	pub ignore_perms: bool,

	/// Peer nodes this repository is shared with (the local node is
	/// implied and not listed).
	pub shared_with: Vec<NodeId>,

	pub pull_order: PullOrder,

	/// Set at runtime when a scan fails; an invalid repository keeps
	/// its last known index but is not scanned again.
	#[serde(skip)]
	pub invalid: Option<String>,
}

impl Default for RepoConfig {
	fn default() -> Self {
		RepoConfig {
			id: String::new(),
			directory: PathBuf::from("."),
			ignore_perms: false,
			shared_with: vec![],
			pull_order: PullOrder::default(),
			invalid: None,
		}
	}
}

/// Top-level process configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
	/// This node's id. Required; the zero id is rejected at load.
	pub node_id: NodeId,

	pub client_name: String,
	pub client_version: String,

	/// Where index snapshots and the cold-map database live.
	pub index_dir: PathBuf,

	/// Suppressor threshold in kB/s.
	pub max_change_kbps: u64,

	#[serde(rename = "repository")]
	pub repositories: Vec<RepoConfig>,
}

impl Default for Config {
	fn default() -> Self {
		Config {
			node_id: NodeId::LOCAL,
			client_name: "meshsync".to_string(),
			client_version: env!("CARGO_PKG_VERSION").to_string(),
			index_dir: PathBuf::from("index"),
			max_change_kbps: crate::suppressor::DEFAULT_THRESHOLD_KBPS,
			repositories: vec![],
		}
	}
}

impl Config {
	pub fn load(path: &Path) -> Result<Config, Box<dyn Error + Send + Sync>> {
		let contents = std::fs::read_to_string(path)?;
		let config: Config = toml::from_str(&contents)?;

		if config.node_id == NodeId::LOCAL {
			return Err(format!("{}: nodeId is missing", path.display()).into());
		}
		for repo in &config.repositories {
			if repo.id.is_empty() {
				return Err(format!("{}: repository with empty id", path.display()).into());
			}
		}
		Ok(config)
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use std::io::Write;
	use tempfile::NamedTempFile;

	#[test]
	fn test_load_minimal() {
		let mut f = NamedTempFile::new().unwrap();
		writeln!(
			f,
			r#"
nodeId = "{}"

[[repository]]
id = "docs"
directory = "/data/docs"
sharedWith = ["{}"]
pullOrder = "smallestFirst"
"#,
			NodeId([0x11; 32]),
			NodeId([0x22; 32]),
		)
		.unwrap();

		let cfg = Config::load(f.path()).unwrap();
		assert_eq!(cfg.node_id, NodeId([0x11; 32]));
		assert_eq!(cfg.client_name, "meshsync");
		assert_eq!(cfg.repositories.len(), 1);
		assert_eq!(cfg.repositories[0].id, "docs");
		assert_eq!(cfg.repositories[0].shared_with, vec![NodeId([0x22; 32])]);
		assert_eq!(cfg.repositories[0].pull_order, PullOrder::SmallestFirst);
		assert!(!cfg.repositories[0].ignore_perms);
	}

	#[test]
	fn test_missing_node_id_is_rejected() {
		let mut f = NamedTempFile::new().unwrap();
		writeln!(f, "indexDir = \"/tmp/idx\"").unwrap();
		assert!(Config::load(f.path()).is_err());
	}

	#[test]
	fn test_empty_repo_id_is_rejected() {
		let mut f = NamedTempFile::new().unwrap();
		writeln!(
			f,
			r#"
nodeId = "{}"

[[repository]]
directory = "/data/docs"
"#,
			NodeId([0x11; 32]),
		)
		.unwrap();
		assert!(Config::load(f.path()).is_err());
	}
}

// vim: ts=4
