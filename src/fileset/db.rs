//! Key-value backing store for cold index maps
//!
//! Backed by redb. Keys are `repo/node/name`; values are the
//! serialized `FileInfo`. The store relies on a single writer per
//! `(repo, node)` key, which the model guarantees by funneling all
//! mutations through the owning `FileSet` instance.

use redb::{ReadableDatabase, ReadableTable, TableDefinition};
use std::collections::BTreeMap;
use std::error::Error;
use std::path::Path;

use crate::types::{FileInfo, NodeId};

const FILES_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("files");

type DbResult<T> = Result<T, Box<dyn Error + Send + Sync>>;

/// Shared on-disk map of `(repo, node, name) -> FileInfo`.
pub struct IndexDb {
	db: redb::Database,
}

impl IndexDb {
	/// Open or create the database and ensure the table exists.
	pub fn open(path: &Path) -> DbResult<Self> {
		let db = redb::Database::create(path)?;
		{
			let write_txn = db.begin_write()?;
			let _ = write_txn.open_table(FILES_TABLE)?;
			write_txn.commit()?;
		}
		Ok(IndexDb { db })
	}

	fn key(repo: &str, node: NodeId, name: &str) -> String {
		format!("{}/{}/{}", repo, node, name)
	}

	fn prefix(repo: &str, node: NodeId) -> String {
		format!("{}/{}/", repo, node)
	}

	pub fn get(&self, repo: &str, node: NodeId, name: &str) -> DbResult<Option<FileInfo>> {
		let read_txn = self.db.begin_read()?;
		let table = read_txn.open_table(FILES_TABLE)?;

		match table.get(Self::key(repo, node, name).as_str())? {
			Some(entry) => {
				let file: FileInfo = serde_json::from_slice(entry.value())?;
				Ok(Some(file))
			}
			None => Ok(None),
		}
	}

	/// Insert or overwrite a batch of entries for one node.
	pub fn put_many(&self, repo: &str, node: NodeId, files: &[FileInfo]) -> DbResult<()> {
		let write_txn = self.db.begin_write()?;
		{
			let mut table = write_txn.open_table(FILES_TABLE)?;
			for f in files {
				let bytes = serde_json::to_vec(f)?;
				table.insert(Self::key(repo, node, &f.name).as_str(), bytes.as_slice())?;
			}
		}
		write_txn.commit()?;
		Ok(())
	}

	/// Replace the node's entire stored map in one transaction.
	pub fn replace_node(
		&self,
		repo: &str,
		node: NodeId,
		files: &BTreeMap<String, FileInfo>,
	) -> DbResult<()> {
		let prefix = Self::prefix(repo, node);
		let write_txn = self.db.begin_write()?;
		{
			let mut table = write_txn.open_table(FILES_TABLE)?;

			let mut stale = Vec::new();
			for item in table.range(prefix.as_str()..)? {
				let (key, _) = item?;
				if !key.value().starts_with(&prefix) {
					break;
				}
				stale.push(key.value().to_string());
			}
			for key in stale {
				table.remove(key.as_str())?;
			}

			for f in files.values() {
				let bytes = serde_json::to_vec(f)?;
				table.insert(Self::key(repo, node, &f.name).as_str(), bytes.as_slice())?;
			}
		}
		write_txn.commit()?;
		Ok(())
	}

	/// All stored entries for one node, in name order.
	pub fn node_files(&self, repo: &str, node: NodeId) -> DbResult<Vec<FileInfo>> {
		let prefix = Self::prefix(repo, node);
		let read_txn = self.db.begin_read()?;
		let table = read_txn.open_table(FILES_TABLE)?;

		let mut files = Vec::new();
		for item in table.range(prefix.as_str()..)? {
			let (key, value) = item?;
			if !key.value().starts_with(&prefix) {
				break;
			}
			files.push(serde_json::from_slice(value.value())?);
		}
		Ok(files)
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use tempfile::TempDir;

	fn file(name: &str, version: u64) -> FileInfo {
		FileInfo { name: name.into(), version, ..Default::default() }
	}

	#[test]
	fn test_put_get() {
		let tmp = TempDir::new().unwrap();
		let db = IndexDb::open(&tmp.path().join("index.db")).unwrap();
		let node = NodeId([1; 32]);

		db.put_many("r", node, &[file("a", 1)]).unwrap();
		let got = db.get("r", node, "a").unwrap().unwrap();
		assert_eq!(got.version, 1);
		assert!(db.get("r", node, "b").unwrap().is_none());
	}

	#[test]
	fn test_replace_node_drops_stale_entries() {
		let tmp = TempDir::new().unwrap();
		let db = IndexDb::open(&tmp.path().join("index.db")).unwrap();
		let node = NodeId([1; 32]);

		db.put_many("r", node, &[file("a", 1), file("b", 1)]).unwrap();

		let mut newer = BTreeMap::new();
		newer.insert("b".to_string(), file("b", 2));
		db.replace_node("r", node, &newer).unwrap();

		assert!(db.get("r", node, "a").unwrap().is_none());
		assert_eq!(db.get("r", node, "b").unwrap().unwrap().version, 2);
	}

	#[test]
	fn test_node_files_is_scoped_to_node_and_repo() {
		let tmp = TempDir::new().unwrap();
		let db = IndexDb::open(&tmp.path().join("index.db")).unwrap();
		let n1 = NodeId([1; 32]);
		let n2 = NodeId([2; 32]);

		db.put_many("r", n1, &[file("a", 1)]).unwrap();
		db.put_many("r", n2, &[file("b", 1)]).unwrap();
		db.put_many("q", n1, &[file("c", 1)]).unwrap();

		let files = db.node_files("r", n1).unwrap();
		assert_eq!(files.len(), 1);
		assert_eq!(files[0].name, "a");
	}
}

// vim: ts=4
