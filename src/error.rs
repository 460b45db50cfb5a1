//! Error types for model operations

use crate::types::NodeId;
use std::error::Error;
use std::fmt;
use std::io;

/// Unified error type for the synchronization model.
///
/// Programmer errors (repo registered twice, connection added twice,
/// operations against repositories that were never configured by the
/// surrounding code) are not represented here; they panic, because they
/// indicate contract violations rather than runtime faults.
#[derive(Debug)]
pub enum ModelError {
	/// The named file is not in the local index, or a request offset
	/// lies beyond the end of the file.
	NoSuchFile,

	/// The named file is marked invalid or deleted locally.
	Invalid,

	/// A peer referenced a repository not configured locally.
	UnknownRepo(String),

	/// A peer referenced a repository it is not authorized for.
	NotShared { repo: String, node: NodeId },

	/// The peer's cluster configuration disagrees with ours.
	ClusterMismatch { reason: String },

	/// The peer connection is gone.
	ConnectionClosed,

	/// Disk or store error, surfaced verbatim.
	Io(io::Error),
}

impl fmt::Display for ModelError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			ModelError::NoSuchFile => write!(f, "no such file"),
			ModelError::Invalid => write!(f, "file is invalid"),
			ModelError::UnknownRepo(repo) => write!(f, "unknown repository: {}", repo),
			ModelError::NotShared { repo, node } => {
				write!(f, "repository {} is not shared with node {}", repo, node.short())
			}
			ModelError::ClusterMismatch { reason } => {
				write!(f, "cluster configuration mismatch: {}", reason)
			}
			ModelError::ConnectionClosed => write!(f, "connection closed"),
			ModelError::Io(e) => write!(f, "I/O error: {}", e),
		}
	}
}

impl Error for ModelError {}

impl From<io::Error> for ModelError {
	fn from(e: io::Error) -> Self {
		ModelError::Io(e)
	}
}


// vim: ts=4
