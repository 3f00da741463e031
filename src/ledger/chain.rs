use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use log::{debug, info, warn};
use thiserror::Error;

use super::account::AccountInfo;
use super::block::{
    Block, BlockError, ChangeBlock, OpenBlock, ReceiveBlock, SendBlock, UniversalBlock,
};
use super::genesis::{NetworkKind, GENESIS_AMOUNT};
use super::storage::{
    KeyValueStore, LedgerBatch, LedgerStore, PendingInfo, StorageError, StoredBlock,
};
use super::types::{Amount, BlockHash, PublicKey};

/// Coarse classes of ledger failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// The block or message itself is unusable
    MalformedInput,
    /// Bad signature or insufficient work; never retried
    InvalidProof,
    /// Valid on its own but contradicts the ledger
    StateConflict,
    /// Storage failure or a full buffer
    ResourceExhaustion,
}

/// Errors that can occur while linking blocks into the lattice
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Malformed block: {0}")]
    Malformed(#[from] BlockError),

    #[error("Invalid signature on block {0}")]
    InvalidSignature(BlockHash),

    #[error("Insufficient work on block {0}")]
    InvalidWork(BlockHash),

    #[error("Account {0} is already open")]
    DuplicateOpen(PublicKey),

    #[error("Block {hash} forks the chain at {previous}")]
    Fork { hash: BlockHash, previous: BlockHash },

    #[error("Block {hash} sends more than its account holds")]
    NegativeSend { hash: BlockHash },

    #[error("Send {send} is not receivable by {account}")]
    Unreceivable { send: BlockHash, account: PublicKey },

    #[error("Block {0} is not a send")]
    NotASend(BlockHash),

    #[error("Block {hash} states balance {stated}, expected {expected}")]
    BalanceMismatch {
        hash: BlockHash,
        stated: Amount,
        expected: Amount,
    },

    #[error("Block {hash} receives {stated}, but the send carries {expected}")]
    AmountMismatch {
        hash: BlockHash,
        stated: Amount,
        expected: Amount,
    },

    #[error("Block {hash} names account {stated} but extends the chain of {owner}")]
    AccountMismatch {
        hash: BlockHash,
        stated: PublicKey,
        owner: PublicKey,
    },

    #[error("Balance overflow at block {0}")]
    Overflow(BlockHash),

    #[error("Block {0} not found")]
    BlockNotFound(BlockHash),

    #[error("Stored genesis {stored} does not match the {network} network genesis {expected}")]
    GenesisMismatch {
        network: NetworkKind,
        stored: BlockHash,
        expected: BlockHash,
    },

    #[error("Orphan pool is full ({0} blocks)")]
    OrphanPoolFull(usize),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

impl LedgerError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            LedgerError::Malformed(_) => ErrorCategory::MalformedInput,
            LedgerError::InvalidSignature(_) | LedgerError::InvalidWork(_) => {
                ErrorCategory::InvalidProof
            }
            LedgerError::DuplicateOpen(_)
            | LedgerError::Fork { .. }
            | LedgerError::NegativeSend { .. }
            | LedgerError::Unreceivable { .. }
            | LedgerError::NotASend(_)
            | LedgerError::BalanceMismatch { .. }
            | LedgerError::AmountMismatch { .. }
            | LedgerError::AccountMismatch { .. }
            | LedgerError::Overflow(_)
            | LedgerError::BlockNotFound(_)
            | LedgerError::GenesisMismatch { .. } => ErrorCategory::StateConflict,
            LedgerError::OrphanPoolFull(_) | LedgerError::Storage(_) => {
                ErrorCategory::ResourceExhaustion
            }
        }
    }
}

/// Result of offering a block to the ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    /// Linked into its chain, along with `linked_orphans` buffered descendants
    Accepted {
        hash: BlockHash,
        linked_orphans: usize,
    },
    /// Already linked; nothing changed
    AlreadyPresent { hash: BlockHash },
    /// Buffered until `missing` arrives
    ParentMissing { hash: BlockHash, missing: BlockHash },
}

impl AddOutcome {
    pub fn hash(&self) -> BlockHash {
        match self {
            AddOutcome::Accepted { hash, .. }
            | AddOutcome::AlreadyPresent { hash }
            | AddOutcome::ParentMissing { hash, .. } => *hash,
        }
    }
}

/// Blocks waiting for a dependency, keyed by the missing hash
///
/// Bounded by `capacity`. When full, the block that has waited longest is
/// evicted to make room for the newcomer.
#[derive(Debug)]
struct OrphanPool {
    waiting: HashMap<BlockHash, Vec<Block>>,
    /// Buffered block to the dependency it waits on and its insertion number
    entries: HashMap<BlockHash, (BlockHash, u64)>,
    /// Insertion order; entries whose number no longer matches are stale
    order: VecDeque<(u64, BlockHash)>,
    next: u64,
    capacity: usize,
}

impl OrphanPool {
    fn new(capacity: usize) -> Self {
        OrphanPool {
            waiting: HashMap::new(),
            entries: HashMap::new(),
            order: VecDeque::new(),
            next: 0,
            capacity,
        }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn contains(&self, hash: &BlockHash) -> bool {
        self.entries.contains_key(hash)
    }

    fn insert(&mut self, missing: BlockHash, hash: BlockHash, block: Block) -> Result<(), LedgerError> {
        if self.entries.contains_key(&hash) {
            return Ok(());
        }
        if self.capacity == 0 {
            return Err(LedgerError::OrphanPoolFull(self.capacity));
        }
        while self.entries.len() >= self.capacity && self.evict_oldest() {}

        let number = self.next;
        self.next += 1;
        self.entries.insert(hash, (missing, number));
        self.order.push_back((number, hash));
        self.waiting.entry(missing).or_default().push(block);

        if self.order.len() > self.capacity.saturating_mul(2) {
            let entries = &self.entries;
            self.order
                .retain(|(number, hash)| matches!(entries.get(hash), Some((_, n)) if n == number));
        }
        Ok(())
    }

    /// Drops the longest-waiting block; false when nothing is buffered
    fn evict_oldest(&mut self) -> bool {
        while let Some((number, hash)) = self.order.pop_front() {
            let missing = match self.entries.get(&hash) {
                Some((missing, n)) if *n == number => *missing,
                _ => continue,
            };

            self.entries.remove(&hash);
            if let Some(blocks) = self.waiting.get_mut(&missing) {
                blocks.retain(|block| block.hash() != hash);
                if blocks.is_empty() {
                    self.waiting.remove(&missing);
                }
            }
            warn!("Orphan pool full, evicted {} waiting for {}", hash, missing);
            return true;
        }
        false
    }

    /// Removes and returns every block waiting on `parent`
    fn take(&mut self, parent: &BlockHash) -> Vec<Block> {
        let blocks = self.waiting.remove(parent).unwrap_or_default();
        for block in &blocks {
            self.entries.remove(&block.hash());
        }
        blocks
    }
}

/// Read access to linked ledger state
///
/// Cheap to clone and safe to use from any thread while the writer runs.
#[derive(Debug, Clone)]
pub struct LedgerReader {
    store: LedgerStore,
    genesis: BlockHash,
}

impl LedgerReader {
    pub fn genesis(&self) -> BlockHash {
        self.genesis
    }

    pub fn block(&self, hash: &BlockHash) -> Result<Option<StoredBlock>, LedgerError> {
        Ok(self.store.get_block(hash)?)
    }

    pub fn contains(&self, hash: &BlockHash) -> Result<bool, LedgerError> {
        Ok(self.store.has_block(hash)?)
    }

    pub fn account(&self, account: &PublicKey) -> Result<Option<AccountInfo>, LedgerError> {
        Ok(self.store.get_account(account)?)
    }

    pub fn accounts(&self) -> Result<Vec<AccountInfo>, LedgerError> {
        Ok(self.store.accounts()?)
    }

    /// Unreceived sends addressed to `account`
    pub fn pending(&self, account: &PublicKey) -> Result<Vec<(BlockHash, PendingInfo)>, LedgerError> {
        Ok(self.store.pending_for(account)?)
    }

    pub fn pending_entry(
        &self,
        account: &PublicKey,
        send: &BlockHash,
    ) -> Result<Option<PendingInfo>, LedgerError> {
        Ok(self.store.get_pending(account, send)?)
    }

    /// Balance of the chain as of block `hash`
    ///
    /// Recorded when the block was linked, so the lookup does not depend on
    /// how long the chain or its counterparties' chains are.
    pub fn balance_of(&self, hash: &BlockHash) -> Result<Amount, LedgerError> {
        self.store
            .get_block(hash)?
            .map(|stored| stored.balance)
            .ok_or(LedgerError::BlockNotFound(*hash))
    }
}

/// The block-lattice: one chain per account, linked as blocks arrive
///
/// `add_block` takes `&mut self`, so a single owner serializes all writes.
/// See [`super::processor::LedgerProcessor`] for the threaded writer.
#[derive(Debug)]
pub struct Ledger {
    store: LedgerStore,
    reader: LedgerReader,
    threshold: u64,
    orphans: OrphanPool,
}

impl Ledger {
    /// Opens the ledger over `kv`, inserting the network's genesis block if the store is empty
    ///
    /// # Arguments
    ///
    /// * `kv` - The store to persist into
    /// * `network` - Selects the genesis block and work threshold
    /// * `max_orphans` - Capacity of the orphan pool
    pub fn new(
        kv: Arc<dyn KeyValueStore>,
        network: NetworkKind,
        max_orphans: usize,
    ) -> Result<Self, LedgerError> {
        let store = LedgerStore::new(kv);
        let genesis = network.genesis();
        let genesis_hash = Block::Open(genesis.clone()).hash();

        match store.genesis()? {
            Some(stored) if stored != genesis_hash => {
                return Err(LedgerError::GenesisMismatch {
                    network,
                    stored,
                    expected: genesis_hash,
                });
            }
            Some(_) => {
                debug!("Opened existing {} ledger", network);
            }
            None => {
                Self::insert_genesis(&store, genesis, genesis_hash)?;
                info!("Initialised {} ledger with genesis {}", network, genesis_hash);
            }
        }

        Ok(Ledger {
            reader: LedgerReader {
                store: store.clone(),
                genesis: genesis_hash,
            },
            store,
            threshold: network.work_threshold(),
            orphans: OrphanPool::new(max_orphans),
        })
    }

    fn insert_genesis(
        store: &LedgerStore,
        genesis: OpenBlock,
        hash: BlockHash,
    ) -> Result<(), LedgerError> {
        let account = genesis.account;
        let info = AccountInfo {
            account,
            head: hash,
            open_block: hash,
            representative: genesis.representative,
            balance: GENESIS_AMOUNT,
            block_count: 1,
        };

        let block = Block::Open(genesis);
        if !block.verify_signature(&account) {
            return Err(LedgerError::InvalidSignature(hash));
        }

        let mut batch = LedgerBatch::new();
        batch.put_block(
            &hash,
            &StoredBlock {
                block,
                account,
                balance: GENESIS_AMOUNT,
            },
        );
        batch.put_open(&account, &hash);
        batch.put_account(&info)?;
        batch.set_genesis(&hash);
        store.commit(batch)?;
        Ok(())
    }

    pub fn reader(&self) -> LedgerReader {
        self.reader.clone()
    }

    pub fn work_threshold(&self) -> u64 {
        self.threshold
    }

    pub fn orphan_count(&self) -> usize {
        self.orphans.len()
    }

    pub fn is_orphan(&self, hash: &BlockHash) -> bool {
        self.orphans.contains(hash)
    }

    pub fn flush(&self) -> Result<(), LedgerError> {
        Ok(self.store.flush()?)
    }

    /// Validates and links a block, then any orphans that were waiting on it
    ///
    /// # Arguments
    ///
    /// * `block` - The block to add
    ///
    /// # Returns
    ///
    /// The outcome; a missing dependency is an outcome, not an error
    pub fn add_block(&mut self, block: Block) -> Result<AddOutcome, LedgerError> {
        let hash = block.hash();

        match self.process(block, hash) {
            Ok(AddOutcome::Accepted { .. }) => {
                let linked_orphans = self.link_orphans(hash);
                Ok(AddOutcome::Accepted {
                    hash,
                    linked_orphans,
                })
            }
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                warn!("Rejected block {}: {}", hash, err);
                Err(err)
            }
        }
    }

    /// Replays orphans breadth-first from `parent` down through everything it unblocks
    fn link_orphans(&mut self, parent: BlockHash) -> usize {
        let mut linked = 0;
        let mut worklist = VecDeque::from([parent]);

        while let Some(parent) = worklist.pop_front() {
            for orphan in self.orphans.take(&parent) {
                let hash = orphan.hash();
                match self.process(orphan, hash) {
                    Ok(AddOutcome::Accepted { .. }) => {
                        linked += 1;
                        worklist.push_back(hash);
                    }
                    Ok(AddOutcome::ParentMissing { missing, .. }) => {
                        debug!("Orphan {} now waits for {}", hash, missing);
                    }
                    Ok(AddOutcome::AlreadyPresent { .. }) => {}
                    Err(err) => {
                        warn!("Dropped orphan {}: {}", hash, err);
                    }
                }
            }
        }

        linked
    }

    fn process(&mut self, block: Block, hash: BlockHash) -> Result<AddOutcome, LedgerError> {
        if self.store.has_block(&hash)? {
            debug!("Block {} already present", hash);
            return Ok(AddOutcome::AlreadyPresent { hash });
        }

        block.check_structure()?;
        if !block.has_valid_work(self.threshold) {
            return Err(LedgerError::InvalidWork(hash));
        }

        // Blocks naming their account are checked before they can take an orphan slot
        if let Some(account) = block.account() {
            if !block.verify_signature(&account) {
                return Err(LedgerError::InvalidSignature(hash));
            }
        }

        for dependency in block.dependencies() {
            if !self.store.has_block(&dependency)? {
                self.orphans.insert(dependency, hash, block)?;
                info!("Block {} is waiting for {}", hash, dependency);
                return Ok(AddOutcome::ParentMissing {
                    hash,
                    missing: dependency,
                });
            }
        }

        let (info, mut batch) = match &block {
            Block::Open(b) => self.link_open(hash, b)?,
            Block::Send(b) => self.link_send(&block, hash, b)?,
            Block::Receive(b) => self.link_receive(&block, hash, b)?,
            Block::Change(b) => self.link_change(&block, hash, b)?,
            Block::Universal(b) => self.link_universal(hash, b)?,
        };

        let block_type = block.block_type();
        let account = info.account;
        batch.put_block(
            &hash,
            &StoredBlock {
                block,
                account,
                balance: info.balance,
            },
        );
        self.store.commit(batch)?;

        info!("Linked {:?} block {} for {}", block_type, hash, account);
        Ok(AddOutcome::Accepted {
            hash,
            linked_orphans: 0,
        })
    }

    /// Account state at `previous`, which must be the head of its chain
    fn chain_head(&self, hash: BlockHash, previous: BlockHash) -> Result<AccountInfo, LedgerError> {
        let parent = self
            .store
            .get_block(&previous)?
            .ok_or(LedgerError::BlockNotFound(previous))?;
        let info = self
            .store
            .get_account(&parent.account)?
            .ok_or(LedgerError::BlockNotFound(previous))?;

        if info.head != previous {
            return Err(LedgerError::Fork { hash, previous });
        }
        Ok(info)
    }

    fn receivable(&self, account: &PublicKey, send: &BlockHash) -> Result<PendingInfo, LedgerError> {
        self.store
            .get_pending(account, send)?
            .ok_or(LedgerError::Unreceivable {
                send: *send,
                account: *account,
            })
    }

    fn check_signer(block: &Block, hash: BlockHash, signer: &PublicKey) -> Result<(), LedgerError> {
        if block.verify_signature(signer) {
            Ok(())
        } else {
            Err(LedgerError::InvalidSignature(hash))
        }
    }

    fn link_open(&self, hash: BlockHash, b: &OpenBlock) -> Result<(AccountInfo, LedgerBatch), LedgerError> {
        if self.store.get_account(&b.account)?.is_some() {
            return Err(LedgerError::DuplicateOpen(b.account));
        }
        let pending = self.receivable(&b.account, &b.source)?;

        let info = AccountInfo {
            account: b.account,
            head: hash,
            open_block: hash,
            representative: b.representative,
            balance: pending.amount,
            block_count: 1,
        };

        let mut batch = LedgerBatch::new();
        batch.put_open(&b.account, &hash);
        batch.delete_pending(&b.account, &b.source);
        batch.put_account(&info)?;
        Ok((info, batch))
    }

    fn link_send(
        &self,
        block: &Block,
        hash: BlockHash,
        b: &SendBlock,
    ) -> Result<(AccountInfo, LedgerBatch), LedgerError> {
        let mut info = self.chain_head(hash, b.previous)?;
        Self::check_signer(block, hash, &info.account)?;

        let amount = info
            .balance
            .checked_sub(b.balance)
            .ok_or(LedgerError::NegativeSend { hash })?;

        info.head = hash;
        info.balance = b.balance;
        info.block_count += 1;

        let mut batch = LedgerBatch::new();
        batch.put_pending(
            &b.destination,
            &hash,
            &PendingInfo {
                source: info.account,
                amount,
            },
        )?;
        batch.put_account(&info)?;
        Ok((info, batch))
    }

    fn link_receive(
        &self,
        block: &Block,
        hash: BlockHash,
        b: &ReceiveBlock,
    ) -> Result<(AccountInfo, LedgerBatch), LedgerError> {
        let mut info = self.chain_head(hash, b.previous)?;
        Self::check_signer(block, hash, &info.account)?;

        let pending = self.receivable(&info.account, &b.source)?;
        info.balance = info
            .balance
            .checked_add(pending.amount)
            .ok_or(LedgerError::Overflow(hash))?;
        info.head = hash;
        info.block_count += 1;

        let mut batch = LedgerBatch::new();
        batch.delete_pending(&info.account, &b.source);
        batch.put_account(&info)?;
        Ok((info, batch))
    }

    fn link_change(
        &self,
        block: &Block,
        hash: BlockHash,
        b: &ChangeBlock,
    ) -> Result<(AccountInfo, LedgerBatch), LedgerError> {
        let mut info = self.chain_head(hash, b.previous)?;
        Self::check_signer(block, hash, &info.account)?;

        info.representative = b.representative;
        info.head = hash;
        info.block_count += 1;

        let mut batch = LedgerBatch::new();
        batch.put_account(&info)?;
        Ok((info, batch))
    }

    fn link_universal(
        &self,
        hash: BlockHash,
        b: &UniversalBlock,
    ) -> Result<(AccountInfo, LedgerBatch), LedgerError> {
        let mut batch = LedgerBatch::new();

        let mut info = if b.is_open() {
            if self.store.get_account(&b.account)?.is_some() {
                return Err(LedgerError::DuplicateOpen(b.account));
            }
            batch.put_open(&b.account, &hash);
            AccountInfo {
                account: b.account,
                head: hash,
                open_block: hash,
                representative: b.representative,
                balance: Amount::ZERO,
                block_count: 0,
            }
        } else {
            let info = self.chain_head(hash, b.previous)?;
            if info.account != b.account {
                return Err(LedgerError::AccountMismatch {
                    hash,
                    stated: b.account,
                    owner: info.account,
                });
            }
            info
        };

        let expected = if b.is_send() {
            let amount = b.magnitude();
            let remaining = info
                .balance
                .checked_sub(amount)
                .ok_or(LedgerError::NegativeSend { hash })?;
            batch.put_pending(
                &b.destination(),
                &hash,
                &PendingInfo {
                    source: b.account,
                    amount,
                },
            )?;
            remaining
        } else if b.is_receive() {
            let pending = self.receivable(&b.account, &b.link)?;
            if pending.amount != b.magnitude() {
                return Err(LedgerError::AmountMismatch {
                    hash,
                    stated: b.magnitude(),
                    expected: pending.amount,
                });
            }
            batch.delete_pending(&b.account, &b.link);
            info.balance
                .checked_add(pending.amount)
                .ok_or(LedgerError::Overflow(hash))?
        } else {
            info.balance
        };

        if b.balance != expected {
            return Err(LedgerError::BalanceMismatch {
                hash,
                stated: b.balance,
                expected,
            });
        }

        info.head = hash;
        info.balance = expected;
        info.representative = b.representative;
        info.block_count += 1;
        batch.put_account(&info)?;
        Ok((info, batch))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::block::SEND_FLAG;
    use crate::ledger::crypto::KeyPair;
    use crate::ledger::genesis::test_keys;
    use crate::ledger::storage::SledStore;
    use crate::ledger::types::Work;
    use crate::ledger::work::{self, TEST_THRESHOLD};
    use std::sync::atomic::AtomicBool;

    fn new_ledger(max_orphans: usize) -> Ledger {
        let kv = Arc::new(SledStore::temporary().unwrap());
        Ledger::new(kv, NetworkKind::Test, max_orphans).unwrap()
    }

    fn finish(mut block: Block, keys: &KeyPair) -> Block {
        let cancel = AtomicBool::new(false);
        let work = work::generate(&block.root(), TEST_THRESHOLD, &cancel).unwrap();
        block.set_work(work);
        block.sign(keys);
        block
    }

    fn send(keys: &KeyPair, previous: BlockHash, destination: PublicKey, balance: u128) -> Block {
        finish(
            Block::Send(SendBlock {
                previous,
                destination,
                balance: Amount(balance),
                ..Default::default()
            }),
            keys,
        )
    }

    fn open(keys: &KeyPair, source: BlockHash) -> Block {
        finish(
            Block::Open(OpenBlock {
                source,
                representative: keys.public_key(),
                account: keys.public_key(),
                ..Default::default()
            }),
            keys,
        )
    }

    fn receive(keys: &KeyPair, previous: BlockHash, source: BlockHash) -> Block {
        finish(
            Block::Receive(ReceiveBlock {
                previous,
                source,
                ..Default::default()
            }),
            keys,
        )
    }

    fn change(keys: &KeyPair, previous: BlockHash, representative: PublicKey) -> Block {
        finish(
            Block::Change(ChangeBlock {
                previous,
                representative,
                ..Default::default()
            }),
            keys,
        )
    }

    fn balance(ledger: &Ledger, account: &PublicKey) -> Amount {
        ledger.reader().account(account).unwrap().unwrap().balance
    }

    fn accepted(outcome: AddOutcome) -> bool {
        matches!(outcome, AddOutcome::Accepted { .. })
    }

    #[test]
    fn test_genesis_holds_entire_supply() {
        let ledger = new_ledger(16);
        let reader = ledger.reader();
        let genesis = test_keys().public_key();

        assert_eq!(balance(&ledger, &genesis), GENESIS_AMOUNT);
        assert_eq!(reader.balance_of(&reader.genesis()).unwrap(), GENESIS_AMOUNT);
        assert_eq!(reader.accounts().unwrap().len(), 1);
    }

    #[test]
    fn test_send_then_open_moves_funds() {
        let mut ledger = new_ledger(16);
        let genesis = test_keys();
        let bob = KeyPair::generate();

        let sent = send(&genesis, ledger.reader().genesis(), bob.public_key(), u128::MAX - 1000);
        let sent_hash = sent.hash();
        assert!(accepted(ledger.add_block(sent).unwrap()));
        assert_eq!(balance(&ledger, &genesis.public_key()), Amount(u128::MAX - 1000));

        let pending = ledger.reader().pending(&bob.public_key()).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].0, sent_hash);
        assert_eq!(pending[0].1.amount, Amount(1000));

        let opened = open(&bob, sent_hash);
        let open_hash = opened.hash();
        assert!(accepted(ledger.add_block(opened).unwrap()));

        let reader = ledger.reader();
        assert_eq!(balance(&ledger, &genesis.public_key()), Amount(u128::MAX - 1000));
        assert_eq!(balance(&ledger, &bob.public_key()), Amount(1000));
        assert_eq!(reader.balance_of(&open_hash).unwrap(), Amount(1000));
        assert_eq!(reader.balance_of(&sent_hash).unwrap(), Amount(u128::MAX - 1000));
        assert!(reader.pending(&bob.public_key()).unwrap().is_empty());
        assert_eq!(
            reader.block(&open_hash).unwrap().unwrap().account,
            bob.public_key()
        );
    }

    #[test]
    fn test_re_adding_a_block_is_a_no_op() {
        let mut ledger = new_ledger(16);
        let genesis = test_keys();
        let bob = KeyPair::generate();

        let sent = send(&genesis, ledger.reader().genesis(), bob.public_key(), u128::MAX - 5);
        let hash = sent.hash();

        assert!(accepted(ledger.add_block(sent.clone()).unwrap()));
        assert_eq!(
            ledger.add_block(sent).unwrap(),
            AddOutcome::AlreadyPresent { hash }
        );

        let info = ledger.reader().account(&genesis.public_key()).unwrap().unwrap();
        assert_eq!(info.balance, Amount(u128::MAX - 5));
        assert_eq!(info.block_count, 2);
        assert_eq!(ledger.reader().pending(&bob.public_key()).unwrap().len(), 1);
    }

    #[test]
    fn test_arrival_order_does_not_change_final_state() {
        let genesis = test_keys();
        let bob = KeyPair::generate();

        let mut in_order = new_ledger(16);
        let mut reversed = new_ledger(16);

        let sent = send(&genesis, in_order.reader().genesis(), bob.public_key(), u128::MAX - 1000);
        let opened = open(&bob, sent.hash());

        assert!(accepted(in_order.add_block(sent.clone()).unwrap()));
        assert!(accepted(in_order.add_block(opened.clone()).unwrap()));

        assert_eq!(
            reversed.add_block(opened.clone()).unwrap(),
            AddOutcome::ParentMissing {
                hash: opened.hash(),
                missing: sent.hash(),
            }
        );
        assert_eq!(reversed.orphan_count(), 1);
        assert!(reversed.is_orphan(&opened.hash()));

        assert_eq!(
            reversed.add_block(sent.clone()).unwrap(),
            AddOutcome::Accepted {
                hash: sent.hash(),
                linked_orphans: 1,
            }
        );
        assert_eq!(reversed.orphan_count(), 0);

        let mut expected = in_order.reader().accounts().unwrap();
        let mut actual = reversed.reader().accounts().unwrap();
        expected.sort_by_key(|info| info.account);
        actual.sort_by_key(|info| info.account);
        assert_eq!(actual, expected);
    }

    #[test]
    fn test_orphan_chain_links_through_worklist() {
        let mut ledger = new_ledger(16);
        let genesis = test_keys();
        let bob = KeyPair::generate();
        let genesis_hash = ledger.reader().genesis();

        let first = send(&genesis, genesis_hash, bob.public_key(), u128::MAX - 100);
        let second = send(&genesis, first.hash(), bob.public_key(), u128::MAX - 300);
        let first_hash = first.hash();
        let opened = open(&bob, first_hash);
        let received = receive(&bob, opened.hash(), second.hash());

        // Waits on its previous, then on its source once that is linked
        assert!(matches!(
            ledger.add_block(received.clone()).unwrap(),
            AddOutcome::ParentMissing { missing, .. } if missing == opened.hash()
        ));
        assert!(matches!(
            ledger.add_block(opened).unwrap(),
            AddOutcome::ParentMissing { missing, .. } if missing == first_hash
        ));
        assert_eq!(ledger.orphan_count(), 2);

        assert_eq!(
            ledger.add_block(first).unwrap(),
            AddOutcome::Accepted {
                hash: first_hash,
                linked_orphans: 1,
            }
        );
        assert!(ledger.is_orphan(&received.hash()));

        assert!(matches!(
            ledger.add_block(second).unwrap(),
            AddOutcome::Accepted { linked_orphans: 1, .. }
        ));
        assert_eq!(ledger.orphan_count(), 0);
        assert_eq!(balance(&ledger, &bob.public_key()), Amount(300));
        assert_eq!(ledger.reader().balance_of(&received.hash()).unwrap(), Amount(300));
    }

    #[test]
    fn test_balance_tracks_sends_and_receives() {
        let mut ledger = new_ledger(16);
        let genesis = test_keys();
        let bob = KeyPair::generate();
        let genesis_hash = ledger.reader().genesis();

        let to_bob_1 = send(&genesis, genesis_hash, bob.public_key(), u128::MAX - 100);
        let to_bob_2 = send(&genesis, to_bob_1.hash(), bob.public_key(), u128::MAX - 300);
        let bob_open = open(&bob, to_bob_1.hash());
        let bob_receive = receive(&bob, bob_open.hash(), to_bob_2.hash());
        let bob_change = change(&bob, bob_receive.hash(), genesis.public_key());
        let to_genesis = send(&bob, bob_change.hash(), genesis.public_key(), 250);
        let genesis_receive = receive(&genesis, to_bob_2.hash(), to_genesis.hash());

        let blocks = vec![
            to_bob_1,
            to_bob_2,
            bob_open,
            bob_receive,
            bob_change.clone(),
            to_genesis.clone(),
            genesis_receive.clone(),
        ];
        for block in blocks {
            assert!(accepted(ledger.add_block(block).unwrap()));
        }

        let reader = ledger.reader();
        assert_eq!(balance(&ledger, &genesis.public_key()), Amount(u128::MAX - 300 + 50));
        assert_eq!(balance(&ledger, &bob.public_key()), Amount(250));
        assert_eq!(reader.balance_of(&bob_change.hash()).unwrap(), Amount(300));
        assert_eq!(reader.balance_of(&to_genesis.hash()).unwrap(), Amount(250));
        assert_eq!(
            reader.balance_of(&genesis_receive.hash()).unwrap(),
            Amount(u128::MAX - 250)
        );

        let bob_info = reader.account(&bob.public_key()).unwrap().unwrap();
        assert_eq!(bob_info.representative, genesis.public_key());
        assert_eq!(bob_info.block_count, 4);
        assert_eq!(bob_info.head, to_genesis.hash());
    }

    #[test]
    fn test_invalid_proofs_are_rejected() {
        let mut ledger = new_ledger(16);
        let genesis = test_keys();
        let bob = KeyPair::generate();
        let genesis_hash = ledger.reader().genesis();

        // Signed by the wrong key
        let forged = send(&bob, genesis_hash, bob.public_key(), 1);
        let err = ledger.add_block(forged).unwrap_err();
        assert!(matches!(err, LedgerError::InvalidSignature(_)));
        assert_eq!(err.category(), ErrorCategory::InvalidProof);

        // Valid signature, work below the threshold
        let mut lazy = send(&genesis, genesis_hash, bob.public_key(), 1);
        let root = lazy.root();
        let bad_work = (0..)
            .map(Work)
            .find(|w| !work::validate(*w, &root, TEST_THRESHOLD))
            .unwrap();
        lazy.set_work(bad_work);
        let err = ledger.add_block(lazy).unwrap_err();
        assert!(matches!(err, LedgerError::InvalidWork(_)));
        assert_eq!(err.category(), ErrorCategory::InvalidProof);

        // Self-describing blocks are checked before being buffered
        let mut unsigned_open = open(&bob, BlockHash([7u8; 32]));
        unsigned_open.sign(&genesis);
        assert!(matches!(
            ledger.add_block(unsigned_open),
            Err(LedgerError::InvalidSignature(_))
        ));
        assert_eq!(ledger.orphan_count(), 0);
        assert_eq!(balance(&ledger, &genesis.public_key()), GENESIS_AMOUNT);
    }

    #[test]
    fn test_duplicate_open_is_rejected() {
        let mut ledger = new_ledger(16);
        let genesis = test_keys();
        let bob = KeyPair::generate();
        let genesis_hash = ledger.reader().genesis();

        let first = send(&genesis, genesis_hash, bob.public_key(), u128::MAX - 10);
        let second = send(&genesis, first.hash(), bob.public_key(), u128::MAX - 20);
        let first_open = open(&bob, first.hash());
        let second_open = open(&bob, second.hash());

        ledger.add_block(first).unwrap();
        ledger.add_block(second).unwrap();
        assert!(accepted(ledger.add_block(first_open).unwrap()));

        let err = ledger.add_block(second_open).unwrap_err();
        assert!(matches!(err, LedgerError::DuplicateOpen(account) if account == bob.public_key()));
        assert_eq!(err.category(), ErrorCategory::StateConflict);
        assert_eq!(balance(&ledger, &bob.public_key()), Amount(10));
    }

    #[test]
    fn test_fork_is_rejected() {
        let mut ledger = new_ledger(16);
        let genesis = test_keys();
        let genesis_hash = ledger.reader().genesis();

        let first = send(&genesis, genesis_hash, KeyPair::generate().public_key(), u128::MAX - 1);
        let rival = send(&genesis, genesis_hash, KeyPair::generate().public_key(), u128::MAX - 2);

        ledger.add_block(first).unwrap();
        assert!(matches!(
            ledger.add_block(rival),
            Err(LedgerError::Fork { previous, .. }) if previous == genesis_hash
        ));
    }

    #[test]
    fn test_send_above_balance_is_rejected() {
        let mut ledger = new_ledger(16);
        let genesis = test_keys();
        let bob = KeyPair::generate();

        let funded = send(&genesis, ledger.reader().genesis(), bob.public_key(), u128::MAX - 1000);
        let opened = open(&bob, funded.hash());
        let overdraw = send(&bob, opened.hash(), genesis.public_key(), 2000);

        ledger.add_block(funded).unwrap();
        ledger.add_block(opened).unwrap();
        let err = ledger.add_block(overdraw).unwrap_err();
        assert!(matches!(err, LedgerError::NegativeSend { .. }));
        assert_eq!(err.category(), ErrorCategory::StateConflict);
        assert_eq!(balance(&ledger, &bob.public_key()), Amount(1000));
    }

    #[test]
    fn test_send_cannot_be_received_by_another_account() {
        let mut ledger = new_ledger(16);
        let genesis = test_keys();
        let bob = KeyPair::generate();
        let carol = KeyPair::generate();

        let to_bob = send(&genesis, ledger.reader().genesis(), bob.public_key(), u128::MAX - 1000);
        let carol_open = open(&carol, to_bob.hash());

        ledger.add_block(to_bob).unwrap();
        assert!(matches!(
            ledger.add_block(carol_open),
            Err(LedgerError::Unreceivable { account, .. }) if account == carol.public_key()
        ));
    }

    #[test]
    fn test_full_orphan_pool_evicts_longest_waiting() {
        let mut ledger = new_ledger(2);
        let genesis = test_keys();
        let stranger = KeyPair::generate();
        let bob = KeyPair::generate();

        // Parents that never arrive
        let junk_1 = change(&stranger, BlockHash([1u8; 32]), stranger.public_key());
        let junk_2 = change(&stranger, BlockHash([2u8; 32]), stranger.public_key());
        for junk in [junk_1.clone(), junk_2.clone(), junk_2.clone()] {
            assert!(matches!(
                ledger.add_block(junk).unwrap(),
                AddOutcome::ParentMissing { .. }
            ));
        }
        // Re-offering a buffered block does not take another slot
        assert_eq!(ledger.orphan_count(), 2);

        let sent = send(&genesis, ledger.reader().genesis(), bob.public_key(), u128::MAX - 700);
        let sent_hash = sent.hash();
        let opened = open(&bob, sent_hash);
        assert!(matches!(
            ledger.add_block(opened.clone()).unwrap(),
            AddOutcome::ParentMissing { missing, .. } if missing == sent_hash
        ));
        assert_eq!(ledger.orphan_count(), 2);
        assert!(!ledger.is_orphan(&junk_1.hash()));
        assert!(ledger.is_orphan(&junk_2.hash()));
        assert!(ledger.is_orphan(&opened.hash()));

        assert_eq!(
            ledger.add_block(sent).unwrap(),
            AddOutcome::Accepted {
                hash: sent_hash,
                linked_orphans: 1,
            }
        );
        assert_eq!(balance(&ledger, &bob.public_key()), Amount(700));
        assert_eq!(ledger.orphan_count(), 1);
    }

    #[test]
    fn test_orphan_pool_without_capacity_refuses_blocks() {
        let mut ledger = new_ledger(0);
        let genesis = test_keys();

        let orphan = receive(&genesis, BlockHash([1u8; 32]), BlockHash([2u8; 32]));
        let err = ledger.add_block(orphan).unwrap_err();
        assert!(matches!(err, LedgerError::OrphanPoolFull(0)));
        assert_eq!(err.category(), ErrorCategory::ResourceExhaustion);
    }

    #[test]
    fn test_balance_lookup_survives_deep_cross_chain_history() {
        const ROUND_TRIPS: usize = 500;

        let mut ledger = new_ledger(16);
        let genesis = test_keys();
        let bob = KeyPair::generate();

        let funded = send(&genesis, ledger.reader().genesis(), bob.public_key(), u128::MAX - 10);
        let opened = open(&bob, funded.hash());
        let mut genesis_head = funded.hash();
        let mut bob_head = opened.hash();
        assert!(accepted(ledger.add_block(funded).unwrap()));
        assert!(accepted(ledger.add_block(opened).unwrap()));

        // Every receive sources a send whose previous is another receive
        for _ in 0..ROUND_TRIPS {
            let to_genesis = send(&bob, bob_head, genesis.public_key(), 9);
            let genesis_receive = receive(&genesis, genesis_head, to_genesis.hash());
            let to_bob = send(&genesis, genesis_receive.hash(), bob.public_key(), u128::MAX - 10);
            let bob_receive = receive(&bob, to_genesis.hash(), to_bob.hash());
            genesis_head = to_bob.hash();
            bob_head = bob_receive.hash();

            for block in [to_genesis, genesis_receive, to_bob, bob_receive] {
                assert!(accepted(ledger.add_block(block).unwrap()));
            }
        }
        assert_eq!(balance(&ledger, &bob.public_key()), Amount(10));

        let reader = ledger.reader();
        let lookup = std::thread::Builder::new()
            .stack_size(256 * 1024)
            .spawn(move || {
                (
                    reader.balance_of(&bob_head).unwrap(),
                    reader.balance_of(&genesis_head).unwrap(),
                )
            })
            .unwrap();

        assert_eq!(lookup.join().unwrap(), (Amount(10), Amount(u128::MAX - 10)));
    }

    #[test]
    fn test_universal_send_and_open() {
        let mut ledger = new_ledger(16);
        let genesis = test_keys();
        let bob = KeyPair::generate();
        let genesis_hash = ledger.reader().genesis();

        let universal_send = finish(
            Block::Universal(UniversalBlock {
                account: genesis.public_key(),
                previous: genesis_hash,
                representative: genesis.public_key(),
                balance: Amount(u128::MAX - 500),
                amount: Amount(SEND_FLAG | 500),
                link: BlockHash::from(bob.public_key()),
                ..Default::default()
            }),
            &genesis,
        );
        let universal_open = finish(
            Block::Universal(UniversalBlock {
                account: bob.public_key(),
                previous: BlockHash::ZERO,
                representative: bob.public_key(),
                balance: Amount(500),
                amount: Amount(500),
                link: universal_send.hash(),
                ..Default::default()
            }),
            &bob,
        );

        assert!(accepted(ledger.add_block(universal_send.clone()).unwrap()));
        assert!(accepted(ledger.add_block(universal_open.clone()).unwrap()));

        assert_eq!(balance(&ledger, &genesis.public_key()), Amount(u128::MAX - 500));
        assert_eq!(balance(&ledger, &bob.public_key()), Amount(500));
        assert_eq!(
            ledger.reader().balance_of(&universal_open.hash()).unwrap(),
            Amount(500)
        );

        // A universal block whose stated balance disagrees is refused
        let wrong_balance = finish(
            Block::Universal(UniversalBlock {
                account: bob.public_key(),
                previous: universal_open.hash(),
                representative: genesis.public_key(),
                balance: Amount(499),
                ..Default::default()
            }),
            &bob,
        );
        assert!(matches!(
            ledger.add_block(wrong_balance),
            Err(LedgerError::BalanceMismatch { .. })
        ));
    }

    #[test]
    fn test_live_ledger_verifies_its_genesis() {
        let kv = Arc::new(SledStore::temporary().unwrap());
        let ledger = Ledger::new(kv, NetworkKind::Live, 16).unwrap();
        let reader = ledger.reader();

        let genesis = crate::ledger::genesis::live_genesis();
        assert_eq!(balance(&ledger, &genesis.account), GENESIS_AMOUNT);
        assert_eq!(reader.balance_of(&reader.genesis()).unwrap(), GENESIS_AMOUNT);
        assert_eq!(ledger.work_threshold(), work::LIVE_THRESHOLD);
    }

    #[test]
    fn test_reopening_keeps_state() {
        let kv: Arc<dyn KeyValueStore> = Arc::new(SledStore::temporary().unwrap());
        let genesis = test_keys();
        let bob = KeyPair::generate();

        let mut ledger = Ledger::new(kv.clone(), NetworkKind::Test, 16).unwrap();
        let sent = send(&genesis, ledger.reader().genesis(), bob.public_key(), u128::MAX - 42);
        ledger.add_block(sent).unwrap();
        drop(ledger);

        let reopened = Ledger::new(kv.clone(), NetworkKind::Test, 16).unwrap();
        assert_eq!(balance(&reopened, &genesis.public_key()), Amount(u128::MAX - 42));

        assert!(matches!(
            Ledger::new(kv, NetworkKind::Live, 16),
            Err(LedgerError::GenesisMismatch { .. })
        ));
    }
}
