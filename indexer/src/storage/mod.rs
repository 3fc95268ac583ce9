//! MDBX-backed log store.
//!
//! Four logical namespaces: `Logs` (global index -> record), `BlockMap`
//! (block number -> block hash anchor), `Checkpoint` (singleton cursor), and
//! `Meta` (schema version and config echo), plus two dup-sorted auxiliary
//! indexes for by-block and by-tx lookups. Integer keys are big-endian on
//! disk, so cursor range walks follow numeric order. Batch commits and
//! rollback each run inside a single read-write transaction.

use alloy_primitives::{Bytes, B256};
use eyre::{eyre, Result, WrapErr};
use reth_db::{
    mdbx::{init_db_for, DatabaseArguments, DatabaseEnv},
    ClientVersion, Database,
};
use reth_codecs::Compact;
use reth_db_api::{
    cursor::{DbCursorRO, DbCursorRW, DbDupCursorRO},
    table::{Compress, Decompress},
    transaction::{DbTx, DbTxMut},
    DatabaseError,
};
use reth_primitives_traits::ValueWithSubKey;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};
use tracing::info;

mod tables {
    use super::{LogIndexEntry, LogRecord, StoredBlockHash};
    use alloy_primitives::B256;
    use reth_db_api::{
        table::{DupSort, TableInfo},
        tables, TableSet, TableType, TableViewer,
    };
    use std::fmt;

    tables! {
        /// Indexed log records keyed by global index.
        table Logs {
            type Key = u64;
            type Value = LogRecord;
        }

        /// Block-number to block-hash anchors.
        table BlockMap {
            type Key = u64;
            type Value = StoredBlockHash;
        }

        /// Singleton ingest checkpoint.
        table Checkpoint {
            type Key = String;
            type Value = Vec<u8>;
        }

        /// Schema version and operator metadata.
        table Meta {
            type Key = String;
            type Value = Vec<u8>;
        }

        /// Log index entries grouped by block number.
        table BlockLogIndex {
            type Key = u64;
            type Value = LogIndexEntry;
            type SubKey = u64;
        }

        /// Log index entries grouped by transaction hash.
        table TxLogIndex {
            type Key = B256;
            type Value = LogIndexEntry;
            type SubKey = u64;
        }
    }
}

const SCHEMA_VERSION: u64 = 1;
const META_SCHEMA_VERSION_KEY: &str = "schema_version";
const META_CONTRACT_KEY: &str = "contract";
const META_TOPIC_KEY: &str = "topic";
const CHECKPOINT_KEY: &str = "current";

/// The indexed unit. Created at commit, removed only by rollback, never
/// mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogRecord {
    pub index: u64,
    pub block_number: u64,
    pub block_hash: B256,
    pub parent_hash: B256,
    pub tx_hash: B256,
    pub log_index: u64,
    pub timestamp: u64,
    /// Event data field, stored verbatim; semantics opaque to the indexer.
    pub payload: Bytes,
    /// Ingest wall time in unix seconds, advisory only.
    pub created_at: u64,
}

/// Durable ingest cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointData {
    pub last_processed_block: u64,
    pub next_index: u64,
    pub last_block_hash: B256,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredBlockHash {
    pub hash: B256,
}

/// Aux index entry pointing a block or tx back at a log index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogIndexEntry {
    pub index: u64,
    pub block_number: u64,
}

impl ValueWithSubKey for LogIndexEntry {
    type SubKey = u64;

    fn get_subkey(&self) -> Self::SubKey {
        self.index
    }
}

impl Compact for LogIndexEntry {
    fn to_compact<B>(&self, buf: &mut B) -> usize
    where
        B: bytes::BufMut + AsMut<[u8]>,
    {
        // Subkey first: dup-sort ordering reads the leading bytes.
        buf.put_slice(&self.index.to_be_bytes());
        buf.put_slice(&self.block_number.to_be_bytes());
        16
    }

    fn from_compact(mut buf: &[u8], _len: usize) -> (Self, &[u8]) {
        use bytes::Buf;
        let mut index_bytes = [0u8; 8];
        index_bytes.copy_from_slice(&buf[..8]);
        buf.advance(8);
        let mut block_bytes = [0u8; 8];
        block_bytes.copy_from_slice(&buf[..8]);
        buf.advance(8);
        (
            Self {
                index: u64::from_be_bytes(index_bytes),
                block_number: u64::from_be_bytes(block_bytes),
            },
            buf,
        )
    }
}

impl Compact for StoredBlockHash {
    fn to_compact<B>(&self, buf: &mut B) -> usize
    where
        B: bytes::BufMut + AsMut<[u8]>,
    {
        buf.put_slice(self.hash.as_slice());
        32
    }

    fn from_compact(buf: &[u8], _len: usize) -> (Self, &[u8]) {
        let hash = B256::from_slice(&buf[..32]);
        (Self { hash }, &buf[32..])
    }
}

macro_rules! impl_compact_value {
    ($($name:ty),+ $(,)?) => {
        $(
            impl Compress for $name {
                type Compressed = Vec<u8>;

                fn compress_to_buf<B: bytes::BufMut + AsMut<[u8]>>(&self, buf: &mut B) {
                    let _ = Compact::to_compact(self, buf);
                }
            }

            impl Decompress for $name {
                fn decompress(value: &[u8]) -> Result<Self, DatabaseError> {
                    let (obj, _) = Compact::from_compact(value, value.len());
                    Ok(obj)
                }
            }
        )+
    };
}

impl_compact_value!(LogIndexEntry, StoredBlockHash);

impl Compress for LogRecord {
    type Compressed = Vec<u8>;

    fn compress_to_buf<B: bytes::BufMut + AsMut<[u8]>>(&self, buf: &mut B) {
        let encoded =
            serde_json::to_vec(self).expect("log record serialization should succeed");
        buf.put_slice(&encoded);
    }
}

impl Decompress for LogRecord {
    fn decompress(value: &[u8]) -> Result<Self, DatabaseError> {
        serde_json::from_slice(value).map_err(|_| DatabaseError::Decode)
    }
}

/// Outcome of a rollback: the rewritten checkpoint plus what was removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RollbackOutcome {
    pub checkpoint: CheckpointData,
    pub removed_records: u64,
}

#[derive(Debug)]
pub struct Storage {
    db: DatabaseEnv,
}

impl Storage {
    /// Open the MDBX environment and bootstrap metadata if needed.
    pub fn open(path: &Path, contract: &str, topic: &str) -> Result<Self> {
        let db_path: PathBuf = path.join("db");
        let args = DatabaseArguments::new(ClientVersion::default());
        let db = init_db_for::<_, tables::Tables>(&db_path, args)
            .wrap_err("failed to open MDBX environment")?;
        let storage = Self { db };
        storage.bootstrap(contract, topic, &db_path)?;
        Ok(storage)
    }

    fn bootstrap(&self, contract: &str, topic: &str, db_path: &Path) -> Result<()> {
        let tx = self.db.tx()?;
        let schema_bytes = tx.get::<tables::Meta>(META_SCHEMA_VERSION_KEY.to_string())?;
        tx.commit()?;

        match schema_bytes {
            None => {
                let tx = self.db.tx_mut()?;
                tx.put::<tables::Meta>(
                    META_SCHEMA_VERSION_KEY.to_string(),
                    encode_json(&SCHEMA_VERSION)?,
                )?;
                tx.put::<tables::Meta>(META_CONTRACT_KEY.to_string(), encode_json(&contract)?)?;
                tx.put::<tables::Meta>(META_TOPIC_KEY.to_string(), encode_json(&topic)?)?;
                tx.commit()?;
                info!(db_path = %db_path.display(), "initialized storage metadata");
            }
            Some(bytes) => {
                let schema_version: u64 = decode_json(&bytes)?;
                if schema_version != SCHEMA_VERSION {
                    return Err(eyre!(
                        "unsupported schema version {schema_version} (expected {SCHEMA_VERSION})"
                    ));
                }

                let tx = self.db.tx()?;
                let stored_contract: String = tx
                    .get::<tables::Meta>(META_CONTRACT_KEY.to_string())?
                    .map(|bytes| decode_json(&bytes))
                    .transpose()?
                    .ok_or_else(|| eyre!("missing contract metadata"))?;
                let stored_topic: String = tx
                    .get::<tables::Meta>(META_TOPIC_KEY.to_string())?
                    .map(|bytes| decode_json(&bytes))
                    .transpose()?
                    .ok_or_else(|| eyre!("missing topic metadata"))?;
                tx.commit()?;

                if !stored_contract.eq_ignore_ascii_case(contract) {
                    return Err(eyre!(
                        "contract mismatch: db={stored_contract} config={contract}"
                    ));
                }
                if !stored_topic.eq_ignore_ascii_case(topic) {
                    return Err(eyre!("topic mismatch: db={stored_topic} config={topic}"));
                }
            }
        }

        Ok(())
    }

    /// Load the persisted ingest cursor, if any.
    pub fn load_checkpoint(&self) -> Result<Option<CheckpointData>> {
        let tx = self.db.tx()?;
        let bytes = tx.get::<tables::Checkpoint>(CHECKPOINT_KEY.to_string())?;
        tx.commit()?;
        bytes.map(|bytes| decode_json(&bytes)).transpose()
    }

    /// Rewrite the checkpoint on its own, without touching records.
    ///
    /// Used for idle flushes; regular commits go through [`Self::store_batch`].
    pub fn save_checkpoint(&self, checkpoint: &CheckpointData) -> Result<()> {
        let tx = self.db.tx_mut()?;
        tx.put::<tables::Checkpoint>(CHECKPOINT_KEY.to_string(), encode_json(checkpoint)?)?;
        tx.commit()?;
        Ok(())
    }

    /// Persist records, anchors, aux index entries, and the checkpoint in a
    /// single transaction. All-or-nothing.
    pub fn store_batch(
        &self,
        records: &[LogRecord],
        anchors: &BTreeMap<u64, B256>,
        checkpoint: &CheckpointData,
    ) -> Result<()> {
        let tx = self.db.tx_mut()?;
        for record in records {
            tx.put::<tables::Logs>(record.index, record.clone())?;
            let entry = LogIndexEntry {
                index: record.index,
                block_number: record.block_number,
            };
            tx.put::<tables::BlockLogIndex>(record.block_number, entry)?;
            tx.put::<tables::TxLogIndex>(record.tx_hash, entry)?;
        }
        for (number, hash) in anchors {
            tx.put::<tables::BlockMap>(*number, StoredBlockHash { hash: *hash })?;
        }
        tx.put::<tables::Checkpoint>(CHECKPOINT_KEY.to_string(), encode_json(checkpoint)?)?;
        tx.commit()?;
        Ok(())
    }

    /// Delete everything above `to_block` (exclusive) and rewind the
    /// checkpoint. Atomic.
    pub fn rollback(&self, to_block: u64) -> Result<RollbackOutcome> {
        let current = self
            .load_checkpoint()?
            .ok_or_else(|| eyre!("rollback requested with no checkpoint"))?;
        if to_block > current.last_processed_block {
            return Err(eyre!(
                "rollback target {to_block} is above the checkpoint {}",
                current.last_processed_block
            ));
        }

        let rollback_start = to_block.saturating_add(1);
        let tx = self.db.tx_mut()?;

        let anchor = tx
            .get::<tables::BlockMap>(to_block)?
            .ok_or_else(|| eyre!("missing anchor for rollback target {to_block}"))?;

        // The log tail above the ancestor is contiguous by the ordering
        // invariant; collect its indices through the block index.
        let mut removed_indices = Vec::new();
        {
            let mut block_index = tx.cursor_write::<tables::BlockLogIndex>()?;
            let mut walker = block_index.walk_range(rollback_start..)?;
            while let Some(entry) = walker.next() {
                let (_, value) = entry?;
                removed_indices.push(value.index);
                walker.delete_current()?;
            }
        }

        {
            let mut logs = tx.cursor_write::<tables::Logs>()?;
            for index in &removed_indices {
                if logs.seek_exact(*index)?.is_some() {
                    logs.delete_current()?;
                }
            }
        }

        {
            let mut anchors = tx.cursor_write::<tables::BlockMap>()?;
            let mut walker = anchors.walk_range(rollback_start..)?;
            while let Some(entry) = walker.next() {
                entry?;
                walker.delete_current()?;
            }
        }

        {
            let mut tx_index = tx.cursor_dup_write::<tables::TxLogIndex>()?;
            let mut walker = tx_index.walk(None)?;
            while let Some(entry) = walker.next() {
                let (_, value) = entry?;
                if value.block_number > to_block {
                    walker.delete_current()?;
                }
            }
        }

        let next_index = removed_indices
            .iter()
            .min()
            .copied()
            .unwrap_or(current.next_index);
        let checkpoint = CheckpointData {
            last_processed_block: to_block,
            next_index,
            last_block_hash: anchor.hash,
            timestamp: current.timestamp,
        };
        tx.put::<tables::Checkpoint>(CHECKPOINT_KEY.to_string(), encode_json(&checkpoint)?)?;
        tx.commit()?;

        Ok(RollbackOutcome {
            checkpoint,
            removed_records: removed_indices.len() as u64,
        })
    }

    /// Fetch a single record by global index.
    pub fn get_log(&self, index: u64) -> Result<Option<LogRecord>> {
        let tx = self.db.tx()?;
        let record = tx.get::<tables::Logs>(index)?;
        tx.commit()?;
        Ok(record)
    }

    /// Fetch records for an inclusive index range, oldest first.
    ///
    /// `end` of `None` scans to the tail; `limit` of 0 means no limit.
    pub fn range_logs(&self, start: u64, end: Option<u64>, limit: usize) -> Result<Vec<LogRecord>> {
        let tx = self.db.tx()?;
        let mut cursor = tx.cursor_read::<tables::Logs>()?;
        let mut out = Vec::new();
        let walker = match end {
            Some(end) => cursor.walk_range(start..=end)?,
            None => cursor.walk_range(start..)?,
        };
        for entry in walker {
            let (_, record) = entry?;
            out.push(record);
            if limit > 0 && out.len() >= limit {
                break;
            }
        }
        tx.commit()?;
        Ok(out)
    }

    /// Fetch all records emitted in a block, ordered by log index.
    pub fn logs_by_block(&self, block_number: u64) -> Result<Vec<LogRecord>> {
        let indices = {
            let tx = self.db.tx()?;
            let mut cursor = tx.cursor_dup_read::<tables::BlockLogIndex>()?;
            let mut indices = Vec::new();
            for entry in cursor.walk_dup(Some(block_number), Some(0))? {
                let (key, value) = entry?;
                if key != block_number {
                    break;
                }
                indices.push(value.index);
            }
            tx.commit()?;
            indices
        };
        self.records_for_indices(&indices)
    }

    /// Fetch all records emitted by a transaction, ordered by log index.
    pub fn logs_by_tx(&self, tx_hash: B256) -> Result<Vec<LogRecord>> {
        let indices = {
            let tx = self.db.tx()?;
            let mut cursor = tx.cursor_dup_read::<tables::TxLogIndex>()?;
            let mut indices = Vec::new();
            for entry in cursor.walk_dup(Some(tx_hash), Some(0))? {
                let (key, value) = entry?;
                if key != tx_hash {
                    break;
                }
                indices.push(value.index);
            }
            tx.commit()?;
            indices
        };
        self.records_for_indices(&indices)
    }

    /// Fetch the stored anchor hash for a block, if any.
    pub fn block_hash(&self, block_number: u64) -> Result<Option<B256>> {
        let tx = self.db.tx()?;
        let anchor = tx.get::<tables::BlockMap>(block_number)?;
        tx.commit()?;
        Ok(anchor.map(|stored| stored.hash))
    }

    /// Total number of stored records.
    ///
    /// Indices are dense, so the last key plus one is the count.
    pub fn total_count(&self) -> Result<u64> {
        let tx = self.db.tx()?;
        let mut cursor = tx.cursor_read::<tables::Logs>()?;
        let last = cursor.last()?;
        tx.commit()?;
        Ok(last.map(|(index, _)| index + 1).unwrap_or(0))
    }

    fn records_for_indices(&self, indices: &[u64]) -> Result<Vec<LogRecord>> {
        let tx = self.db.tx()?;
        let mut out = Vec::with_capacity(indices.len());
        for index in indices {
            let record = tx
                .get::<tables::Logs>(*index)?
                .ok_or_else(|| eyre!("dangling index entry for log {index}"))?;
            out.push(record);
        }
        tx.commit()?;
        Ok(out)
    }
}

fn encode_json<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).wrap_err("failed to encode metadata")
}

fn decode_json<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes).wrap_err("failed to decode metadata")
}
