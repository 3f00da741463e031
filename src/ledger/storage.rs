use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::account::AccountInfo;
use super::block::Block;
use super::types::{Amount, BlockHash, PublicKey};
use crate::network::message::{decode_block, encode_block};

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),
}

/// Ordered byte-keyed store the ledger persists into
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError>;

    fn set(&self, key: &[u8], value: &[u8]) -> Result<(), StorageError>;

    /// All entries whose key starts with `prefix`, in key order
    fn prefix_scan(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError>;

    /// Applies every write in the batch atomically
    fn commit(&self, batch: WriteBatch) -> Result<(), StorageError>;

    fn flush(&self) -> Result<(), StorageError>;
}

#[derive(Debug)]
enum BatchOp {
    Set(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
}

/// Writes collected for one atomic commit
#[derive(Debug, Default)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.ops.push(BatchOp::Set(key, value));
    }

    pub fn delete(&mut self, key: Vec<u8>) {
        self.ops.push(BatchOp::Delete(key));
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// `KeyValueStore` backed by a sled database
pub struct SledStore {
    db: sled::Db,
}

impl std::fmt::Debug for SledStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SledStore").finish()
    }
}

impl SledStore {
    /// Opens (or creates) the database at `path`
    ///
    /// # Arguments
    ///
    /// * `path` - The path to the database directory
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let db = sled::open(path)?;
        Ok(Self { db })
    }

    /// Opens a database that is deleted when dropped
    pub fn temporary() -> Result<Self, StorageError> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self { db })
    }
}

impl KeyValueStore for SledStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.db.get(key)?.map(|value| value.to_vec()))
    }

    fn set(&self, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        self.db.insert(key, value)?;
        Ok(())
    }

    fn prefix_scan(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError> {
        self.db
            .scan_prefix(prefix)
            .map(|entry| {
                entry
                    .map(|(key, value)| (key.to_vec(), value.to_vec()))
                    .map_err(StorageError::from)
            })
            .collect()
    }

    fn commit(&self, batch: WriteBatch) -> Result<(), StorageError> {
        let mut sled_batch = sled::Batch::default();
        for op in batch.ops {
            match op {
                BatchOp::Set(key, value) => sled_batch.insert(key, value),
                BatchOp::Delete(key) => sled_batch.remove(key),
            }
        }

        self.db.apply_batch(sled_batch)?;
        Ok(())
    }

    fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }
}

const BLOCK_PREFIX: &[u8] = b"block:";
const OPEN_PREFIX: &[u8] = b"open:";
const ACCOUNT_PREFIX: &[u8] = b"account:";
const PENDING_PREFIX: &[u8] = b"pending:";
const GENESIS_KEY: &[u8] = b"meta:genesis";

fn key(prefix: &[u8], parts: &[&[u8; 32]]) -> Vec<u8> {
    let mut key = prefix.to_vec();
    for part in parts {
        key.extend_from_slice(&part[..]);
    }
    key
}

fn to_array(bytes: &[u8]) -> Result<[u8; 32], StorageError> {
    bytes.try_into().map_err(|_| {
        StorageError::DeserializationError(format!("expected 32 bytes, got {}", bytes.len()))
    })
}

fn serialize<T: Serialize>(value: &T) -> Result<Vec<u8>, StorageError> {
    bincode::serialize(value).map_err(|e| StorageError::SerializationError(e.to_string()))
}

fn deserialize<'a, T: Deserialize<'a>>(bytes: &'a [u8]) -> Result<T, StorageError> {
    bincode::deserialize(bytes).map_err(|e| StorageError::DeserializationError(e.to_string()))
}

/// A linked block, the account whose chain holds it, and that chain's balance after it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBlock {
    pub block: Block,
    pub account: PublicKey,
    pub balance: Amount,
}

impl StoredBlock {
    /// Block-type byte, wire body, the owning account, then the balance big-endian
    fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = encode_block(&self.block);
        bytes.extend_from_slice(self.account.as_bytes());
        bytes.extend_from_slice(&self.balance.raw().to_be_bytes());
        bytes
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, StorageError> {
        if bytes.len() < 48 {
            return Err(StorageError::DeserializationError(
                "stored block too short".to_string(),
            ));
        }

        let (rest, balance) = bytes.split_at(bytes.len() - 16);
        let (encoded, account) = rest.split_at(rest.len() - 32);
        let block = decode_block(encoded)
            .map_err(|e| StorageError::DeserializationError(e.to_string()))?;
        let balance: [u8; 16] = balance.try_into().map_err(|_| {
            StorageError::DeserializationError("stored balance truncated".to_string())
        })?;

        Ok(StoredBlock {
            block,
            account: PublicKey(to_array(account)?),
            balance: Amount(u128::from_be_bytes(balance)),
        })
    }
}

/// A send that its destination has not yet received
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingInfo {
    /// Account that sent the funds
    pub source: PublicKey,
    pub amount: Amount,
}

/// Typed ledger writes, committed together by [`LedgerStore::commit`]
#[derive(Debug, Default)]
pub struct LedgerBatch {
    inner: WriteBatch,
}

impl LedgerBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_block(&mut self, hash: &BlockHash, stored: &StoredBlock) {
        self.inner
            .set(key(BLOCK_PREFIX, &[hash.as_bytes()]), stored.to_bytes());
    }

    /// Indexes the open block of `account`
    pub fn put_open(&mut self, account: &PublicKey, hash: &BlockHash) {
        self.inner
            .set(key(OPEN_PREFIX, &[account.as_bytes()]), hash.as_bytes().to_vec());
    }

    pub fn put_account(&mut self, info: &AccountInfo) -> Result<(), StorageError> {
        self.inner.set(
            key(ACCOUNT_PREFIX, &[info.account.as_bytes()]),
            serialize(info)?,
        );
        Ok(())
    }

    pub fn put_pending(
        &mut self,
        destination: &PublicKey,
        send: &BlockHash,
        pending: &PendingInfo,
    ) -> Result<(), StorageError> {
        self.inner.set(
            key(PENDING_PREFIX, &[destination.as_bytes(), send.as_bytes()]),
            serialize(pending)?,
        );
        Ok(())
    }

    pub fn delete_pending(&mut self, destination: &PublicKey, send: &BlockHash) {
        self.inner
            .delete(key(PENDING_PREFIX, &[destination.as_bytes(), send.as_bytes()]));
    }

    pub fn set_genesis(&mut self, hash: &BlockHash) {
        self.inner.set(GENESIS_KEY.to_vec(), hash.as_bytes().to_vec());
    }
}

/// Ledger records laid out over a [`KeyValueStore`]
///
/// Keys are a table prefix followed by raw hash or key bytes. Blocks are
/// stored in their wire encoding; account and pending records use bincode.
#[derive(Clone)]
pub struct LedgerStore {
    kv: Arc<dyn KeyValueStore>,
}

impl std::fmt::Debug for LedgerStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerStore").finish()
    }
}

impl LedgerStore {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        LedgerStore { kv }
    }

    pub fn get_block(&self, hash: &BlockHash) -> Result<Option<StoredBlock>, StorageError> {
        match self.kv.get(&key(BLOCK_PREFIX, &[hash.as_bytes()]))? {
            Some(bytes) => Ok(Some(StoredBlock::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn has_block(&self, hash: &BlockHash) -> Result<bool, StorageError> {
        Ok(self.kv.get(&key(BLOCK_PREFIX, &[hash.as_bytes()]))?.is_some())
    }

    /// Hash of the block that opened `account`
    pub fn open_block(&self, account: &PublicKey) -> Result<Option<BlockHash>, StorageError> {
        match self.kv.get(&key(OPEN_PREFIX, &[account.as_bytes()]))? {
            Some(bytes) => Ok(Some(BlockHash(to_array(&bytes)?))),
            None => Ok(None),
        }
    }

    pub fn get_account(&self, account: &PublicKey) -> Result<Option<AccountInfo>, StorageError> {
        match self.kv.get(&key(ACCOUNT_PREFIX, &[account.as_bytes()]))? {
            Some(bytes) => Ok(Some(deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn accounts(&self) -> Result<Vec<AccountInfo>, StorageError> {
        self.kv
            .prefix_scan(ACCOUNT_PREFIX)?
            .iter()
            .map(|(_, value)| deserialize(value))
            .collect()
    }

    pub fn get_pending(
        &self,
        destination: &PublicKey,
        send: &BlockHash,
    ) -> Result<Option<PendingInfo>, StorageError> {
        let key = key(PENDING_PREFIX, &[destination.as_bytes(), send.as_bytes()]);
        match self.kv.get(&key)? {
            Some(bytes) => Ok(Some(deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Unreceived sends addressed to `destination`, keyed by send hash
    pub fn pending_for(
        &self,
        destination: &PublicKey,
    ) -> Result<Vec<(BlockHash, PendingInfo)>, StorageError> {
        let prefix = key(PENDING_PREFIX, &[destination.as_bytes()]);

        self.kv
            .prefix_scan(&prefix)?
            .iter()
            .map(|(key, value)| -> Result<(BlockHash, PendingInfo), StorageError> {
                let send = BlockHash(to_array(&key[prefix.len()..])?);
                Ok((send, deserialize(value)?))
            })
            .collect()
    }

    pub fn genesis(&self) -> Result<Option<BlockHash>, StorageError> {
        match self.kv.get(GENESIS_KEY)? {
            Some(bytes) => Ok(Some(BlockHash(to_array(&bytes)?))),
            None => Ok(None),
        }
    }

    pub fn commit(&self, batch: LedgerBatch) -> Result<(), StorageError> {
        self.kv.commit(batch.inner)
    }

    pub fn flush(&self) -> Result<(), StorageError> {
        self.kv.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::block::{OpenBlock, SendBlock};
    use crate::ledger::types::{Signature, Work};

    fn store() -> LedgerStore {
        LedgerStore::new(Arc::new(SledStore::temporary().unwrap()))
    }

    #[test]
    fn test_sled_store_prefix_scan() {
        let kv = SledStore::temporary().unwrap();
        kv.set(b"a:1", b"one").unwrap();
        kv.set(b"a:2", b"two").unwrap();
        kv.set(b"b:1", b"other").unwrap();

        let entries = kv.prefix_scan(b"a:").unwrap();
        assert_eq!(
            entries,
            vec![
                (b"a:1".to_vec(), b"one".to_vec()),
                (b"a:2".to_vec(), b"two".to_vec()),
            ]
        );
        assert_eq!(kv.get(b"missing").unwrap(), None);
    }

    #[test]
    fn test_batch_applies_sets_and_deletes() {
        let kv = SledStore::temporary().unwrap();
        kv.set(b"gone", b"x").unwrap();

        let mut batch = WriteBatch::new();
        batch.set(b"kept".to_vec(), b"y".to_vec());
        batch.delete(b"gone".to_vec());
        assert_eq!(batch.len(), 2);
        kv.commit(batch).unwrap();

        assert_eq!(kv.get(b"kept").unwrap(), Some(b"y".to_vec()));
        assert_eq!(kv.get(b"gone").unwrap(), None);
    }

    #[test]
    fn test_block_records_round_trip() {
        let store = store();
        let account = PublicKey([5u8; 32]);
        let stored = StoredBlock {
            block: Block::Send(SendBlock {
                previous: BlockHash([1u8; 32]),
                destination: PublicKey([2u8; 32]),
                balance: Amount(77),
                work: Work(99),
                signature: Signature([3u8; 64]),
            }),
            account,
            balance: Amount(77),
        };
        let hash = stored.block.hash();

        let mut batch = LedgerBatch::new();
        batch.put_block(&hash, &stored);
        store.commit(batch).unwrap();

        assert!(store.has_block(&hash).unwrap());
        assert_eq!(store.get_block(&hash).unwrap(), Some(stored));
        assert_eq!(store.get_block(&BlockHash([9u8; 32])).unwrap(), None);
    }

    #[test]
    fn test_account_and_open_index() {
        let store = store();
        let open = Block::Open(OpenBlock {
            source: BlockHash([1u8; 32]),
            account: PublicKey([4u8; 32]),
            ..Default::default()
        });
        let hash = open.hash();
        let info = AccountInfo {
            account: PublicKey([4u8; 32]),
            head: hash,
            open_block: hash,
            representative: PublicKey([4u8; 32]),
            balance: Amount(1000),
            block_count: 1,
        };

        let mut batch = LedgerBatch::new();
        batch.put_open(&info.account, &hash);
        batch.put_account(&info).unwrap();
        store.commit(batch).unwrap();

        assert_eq!(store.open_block(&info.account).unwrap(), Some(hash));
        assert_eq!(store.get_account(&info.account).unwrap(), Some(info.clone()));
        assert_eq!(store.accounts().unwrap(), vec![info]);
        assert_eq!(store.get_account(&PublicKey([8u8; 32])).unwrap(), None);
    }

    #[test]
    fn test_pending_scan_is_per_destination() {
        let store = store();
        let alice = PublicKey([1u8; 32]);
        let bob = PublicKey([2u8; 32]);
        let pending = PendingInfo {
            source: bob,
            amount: Amount(25),
        };

        let mut batch = LedgerBatch::new();
        batch.put_pending(&alice, &BlockHash([10u8; 32]), &pending).unwrap();
        batch.put_pending(&alice, &BlockHash([11u8; 32]), &pending).unwrap();
        batch.put_pending(&bob, &BlockHash([12u8; 32]), &pending).unwrap();
        store.commit(batch).unwrap();

        let for_alice = store.pending_for(&alice).unwrap();
        assert_eq!(for_alice.len(), 2);
        assert_eq!(for_alice[0], (BlockHash([10u8; 32]), pending));

        let mut batch = LedgerBatch::new();
        batch.delete_pending(&alice, &BlockHash([10u8; 32]));
        store.commit(batch).unwrap();

        assert_eq!(store.get_pending(&alice, &BlockHash([10u8; 32])).unwrap(), None);
        assert_eq!(store.pending_for(&alice).unwrap().len(), 1);
        assert_eq!(store.pending_for(&bob).unwrap().len(), 1);
    }
}
