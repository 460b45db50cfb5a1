//! # meshsync - peer-to-peer file replication core
//!
//! Every node holds one or more named repositories (directory trees),
//! each shared with a declared set of peers. A node scans its own trees,
//! exchanges file indexes with its peers, and pulls missing blocks until
//! all peers sharing a repository converge on the latest version of
//! every file. Conflicts are resolved by a per-file Lamport version with
//! a node-id tiebreak; the system is eventually consistent.
//!
//! The [`model::Model`] is the central per-process object: it owns the
//! per-repository [`fileset::FileSet`]s, implements the peer-protocol
//! callbacks, runs the broadcast loop and drives scanners and pullers.
//! The on-wire framing of the peer protocol lives outside this crate,
//! behind the traits in [`protocol`].
//!
//! ```rust,ignore
//! use meshsync::config::Config;
//! use meshsync::model::Model;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let cfg = Config::load("meshsync.toml".as_ref()).unwrap();
//!     let model = Model::new(cfg.node_id, &cfg.client_name, &cfg.client_version, &cfg.index_dir);
//!     let model = Arc::new(model);
//!     for repo in cfg.repositories.clone() {
//!         model.add_repo(repo).await;
//!     }
//!     model.load_indexes().await;
//!     model.scan_repos().await;
//!     model.start();
//! }
//! ```

#![deny(unsafe_code)]

pub mod clock;
pub mod cluster;
pub mod config;
pub mod error;
pub mod fileset;
pub mod index_store;
pub mod logging;
pub mod model;
pub mod protocol;
pub mod puller;
pub mod scanner;
pub mod suppressor;
pub mod types;

// Re-export commonly used types
pub use error::ModelError;
pub use model::{Counts, Model, RepoState};
pub use types::{Block, FileInfo, NodeId};

// vim: ts=4
