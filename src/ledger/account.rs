use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::block::{Block, ChangeBlock, OpenBlock, ReceiveBlock, SendBlock};
use super::chain::{LedgerError, LedgerReader};
use super::crypto::KeyPair;
use super::types::{Amount, BlockHash, PublicKey, Work};
use super::work::{self, WorkError, WorkPool};

/// Errors that can occur while building blocks for an account
#[derive(Debug, Error)]
pub enum AccountError {
    #[error("No work prepared for the next block")]
    NoWork,

    #[error("Prepared work does not match the current root")]
    StaleWork,

    #[error("Insufficient funds: required {required}, available {available}")]
    InsufficientFunds { required: Amount, available: Amount },

    #[error("Account is already open")]
    AlreadyOpen,

    #[error("Account is not open")]
    NotOpen,

    #[error("Source block {0} not found")]
    SourceNotFound(BlockHash),

    #[error("Block {0} is not a send")]
    NotASend(BlockHash),

    #[error("Send {0} is addressed to another account")]
    WrongDestination(BlockHash),

    #[error("Send {0} was already received")]
    AlreadyReceived(BlockHash),

    #[error("Work error: {0}")]
    Work(#[from] WorkError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),
}

/// Current state of an account chain as recorded by the ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountInfo {
    pub account: PublicKey,
    /// Latest block in the chain
    pub head: BlockHash,
    pub open_block: BlockHash,
    pub representative: PublicKey,
    pub balance: Amount,
    pub block_count: u64,
}

/// Builds and signs the next blocks of one account chain
///
/// Tracks the chain head and balance locally, so consecutive blocks can be
/// built before the ledger has linked the previous ones. Every block consumes
/// one prepared work value.
#[derive(Debug)]
pub struct Account {
    keys: KeyPair,
    head: Option<BlockHash>,
    balance: Amount,
    representative: PublicKey,
    work: Option<Work>,
    threshold: u64,
}

impl Account {
    /// Loads the account's state from the ledger, or starts an unopened account
    ///
    /// # Arguments
    ///
    /// * `keys` - The key pair owning the chain
    /// * `ledger` - Source of the chain's current head and balance
    /// * `threshold` - Work threshold blocks must meet
    pub fn load(keys: KeyPair, ledger: &LedgerReader, threshold: u64) -> Result<Self, AccountError> {
        let info = ledger.account(&keys.public_key())?;
        let representative = keys.public_key();

        Ok(match info {
            Some(info) => Account {
                keys,
                head: Some(info.head),
                balance: info.balance,
                representative: info.representative,
                work: None,
                threshold,
            },
            None => Account {
                keys,
                head: None,
                balance: Amount::ZERO,
                representative,
                work: None,
                threshold,
            },
        })
    }

    pub fn public_key(&self) -> PublicKey {
        self.keys.public_key()
    }

    pub fn address(&self) -> String {
        self.keys.address()
    }

    pub fn head(&self) -> Option<BlockHash> {
        self.head
    }

    pub fn balance(&self) -> Amount {
        self.balance
    }

    pub fn representative(&self) -> PublicKey {
        self.representative
    }

    pub fn is_open(&self) -> bool {
        self.head.is_some()
    }

    /// Root the next block's work must be computed against
    pub fn root(&self) -> BlockHash {
        self.head
            .unwrap_or_else(|| BlockHash::from(self.keys.public_key()))
    }

    /// Uses externally computed work for the next block
    pub fn set_work(&mut self, work: Work) {
        self.work = Some(work);
    }

    pub fn has_work(&self) -> bool {
        self.work.is_some()
    }

    /// Generates work for the current root on the pool
    ///
    /// Returns `false` if the search was cancelled before finishing.
    pub async fn prepare_work(&mut self, pool: &WorkPool) -> Result<bool, AccountError> {
        let handle = pool.generate(self.public_key(), self.root())?;

        match handle.await {
            Some(work) => {
                self.work = Some(work);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Opens the account by receiving `source`
    pub fn open(
        &mut self,
        ledger: &LedgerReader,
        source: BlockHash,
        representative: PublicKey,
    ) -> Result<Block, AccountError> {
        if self.is_open() || ledger.account(&self.public_key())?.is_some() {
            return Err(AccountError::AlreadyOpen);
        }
        let amount = self.receivable(ledger, source)?;

        let block = Block::Open(OpenBlock {
            source,
            representative,
            account: self.public_key(),
            ..Default::default()
        });
        let block = self.finish(block, amount)?;
        self.representative = representative;
        Ok(block)
    }

    /// Balance left after sending `amount`; needs no work, so callers can
    /// refuse a send before generating any
    pub fn check_send(&self, amount: Amount) -> Result<Amount, AccountError> {
        if !self.is_open() {
            return Err(AccountError::NotOpen);
        }
        self.balance
            .checked_sub(amount)
            .ok_or(AccountError::InsufficientFunds {
                required: amount,
                available: self.balance,
            })
    }

    /// Sends `amount` to `destination`
    pub fn send(&mut self, destination: PublicKey, amount: Amount) -> Result<Block, AccountError> {
        let previous = self.head.ok_or(AccountError::NotOpen)?;
        let balance = self.check_send(amount)?;

        let block = Block::Send(SendBlock {
            previous,
            destination,
            balance,
            ..Default::default()
        });
        self.finish(block, balance)
    }

    /// Receives the pending send `source` into an open account
    pub fn receive(&mut self, ledger: &LedgerReader, source: BlockHash) -> Result<Block, AccountError> {
        let previous = self.head.ok_or(AccountError::NotOpen)?;
        let amount = self.receivable(ledger, source)?;
        let balance = self
            .balance
            .checked_add(amount)
            .ok_or(AccountError::Ledger(LedgerError::Overflow(source)))?;

        let block = Block::Receive(ReceiveBlock {
            previous,
            source,
            ..Default::default()
        });
        self.finish(block, balance)
    }

    /// Delegates the account's weight to `representative`
    pub fn change(&mut self, representative: PublicKey) -> Result<Block, AccountError> {
        let previous = self.head.ok_or(AccountError::NotOpen)?;

        let block = Block::Change(ChangeBlock {
            previous,
            representative,
            ..Default::default()
        });
        let block = self.finish(block, self.balance)?;
        self.representative = representative;
        Ok(block)
    }

    /// Amount the pending send `source` would credit to this account
    fn receivable(&self, ledger: &LedgerReader, source: BlockHash) -> Result<Amount, AccountError> {
        let account = self.public_key();
        if let Some(pending) = ledger.pending_entry(&account, &source)? {
            return Ok(pending.amount);
        }

        let stored = ledger
            .block(&source)?
            .ok_or(AccountError::SourceNotFound(source))?;

        let destination = match &stored.block {
            Block::Send(b) => b.destination,
            Block::Universal(b) if b.is_send() => b.destination(),
            _ => return Err(AccountError::NotASend(source)),
        };

        if destination != account {
            Err(AccountError::WrongDestination(source))
        } else {
            Err(AccountError::AlreadyReceived(source))
        }
    }

    fn take_work(&mut self) -> Result<Work, AccountError> {
        let work = self.work.take().ok_or(AccountError::NoWork)?;
        if !work::validate(work, &self.root(), self.threshold) {
            return Err(AccountError::StaleWork);
        }
        Ok(work)
    }

    fn finish(&mut self, mut block: Block, balance: Amount) -> Result<Block, AccountError> {
        let work = self.take_work()?;
        block.set_work(work);
        block.sign(&self.keys);

        self.head = Some(block.hash());
        self.balance = balance;
        Ok(block)
    }
}
