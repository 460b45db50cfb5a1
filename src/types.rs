//! Core data types of the replication index
//!
//! A `FileInfo` is the unit of replication: a repository-relative name,
//! a flag word (type, validity and permission bits), a Lamport version
//! and the block list describing the file content. Every per-node map,
//! the global view and the need view all hold `FileInfo` values.

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Entry is a deletion tombstone.
pub const FLAG_DELETED: u32 = 1 << 12;

/// Entry is excluded from the global view (suppressed or unreadable).
pub const FLAG_INVALID: u32 = 1 << 13;

/// Entry describes a directory; it carries no blocks.
pub const FLAG_DIRECTORY: u32 = 1 << 14;

/// Unix permission bits carried in the low flag bits.
pub const FLAG_PERM_MASK: u32 = 0o777;

/// Accounting size for entries without content (directories, deletions
/// and empty files), so that progress reporting treats them as visible
/// pending work.
pub const ZERO_ENTRY_SIZE: u64 = 128;

/// Fixed content block size.
pub const BLOCK_SIZE: usize = 128 * 1024;

/// Fixed-width node identifier, totally ordered.
///
/// The all-zero value `NodeId::LOCAL` is a sentinel meaning "this node";
/// a `FileSet` resolves it to the real local id before any comparison,
/// so version tie-breaks compare the same ids on every node.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub [u8; 32]);

impl NodeId {
	/// Sentinel for the local node.
	pub const LOCAL: NodeId = NodeId([0u8; 32]);

	pub fn new(bytes: [u8; 32]) -> Self {
		NodeId(bytes)
	}

	/// Parse a 64-character hex string.
	pub fn from_hex(s: &str) -> Result<Self, String> {
		let bytes = hex::decode(s).map_err(|e| format!("invalid node id {:?}: {}", s, e))?;
		if bytes.len() != 32 {
			return Err(format!("invalid node id {:?}: expected 32 bytes, got {}", s, bytes.len()));
		}
		let mut id = [0u8; 32];
		id.copy_from_slice(&bytes);
		Ok(NodeId(id))
	}

	pub fn is_local(&self) -> bool {
		*self == NodeId::LOCAL
	}

	/// Short prefix for log lines.
	pub fn short(&self) -> String {
		hex::encode(self.0)[..7].to_string()
	}
}

impl fmt::Display for NodeId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", hex::encode(self.0))
	}
}

impl fmt::Debug for NodeId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "NodeId({})", self.short())
	}
}

impl Serialize for NodeId {
	fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
	where
		S: Serializer,
	{
		serializer.serialize_str(&hex::encode(self.0))
	}
}

struct NodeIdVisitor;

impl<'de> Visitor<'de> for NodeIdVisitor {
	type Value = NodeId;

	fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
		formatter.write_str("a 64-character hex node id")
	}

	fn visit_str<E>(self, v: &str) -> Result<NodeId, E>
	where
		E: de::Error,
	{
		NodeId::from_hex(v).map_err(de::Error::custom)
	}
}

impl<'de> Deserialize<'de> for NodeId {
	fn deserialize<D>(deserializer: D) -> Result<NodeId, D::Error>
	where
		D: Deserializer<'de>,
	{
		deserializer.deserialize_str(NodeIdVisitor)
	}
}

/// One content block of a regular file.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct Block {
	pub offset: u64,
	pub size: u32,
	pub hash: [u8; 32],
}

/// The replication unit.
///
/// `name` is a repository-relative path with forward slashes and no
/// `..` components. `version` is a Lamport timestamp, strictly
/// increasing per name across the cluster; ties are broken by NodeId.
#[derive(Clone, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
pub struct FileInfo {
	pub name: String,
	pub flags: u32,
	pub modified: i64,
	pub version: u64,
	pub size: u64,
	pub blocks: Vec<Block>,
}

impl FileInfo {
	pub fn is_deleted(&self) -> bool {
		self.flags & FLAG_DELETED != 0
	}

	pub fn is_invalid(&self) -> bool {
		self.flags & FLAG_INVALID != 0
	}

	pub fn is_directory(&self) -> bool {
		self.flags & FLAG_DIRECTORY != 0
	}

	/// True for the zero value returned when an entry is absent.
	pub fn is_empty(&self) -> bool {
		self.name.is_empty()
	}

	pub fn permissions(&self) -> u32 {
		self.flags & FLAG_PERM_MASK
	}

	/// Accounting size: entries without content count at
	/// `ZERO_ENTRY_SIZE`, everything else at its byte size.
	pub fn entry_size(&self) -> u64 {
		if self.is_deleted() || self.is_directory() || self.blocks.is_empty() {
			ZERO_ENTRY_SIZE
		} else {
			self.size
		}
	}
}


// vim: ts=4
