use std::thread::{self, JoinHandle};

use log::{info, warn};
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::oneshot;

use super::block::Block;
use super::chain::{AddOutcome, ErrorCategory, Ledger, LedgerError};

/// Errors that can occur when handing blocks to the ledger writer
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("Ledger channel is full")]
    ChannelFull,

    #[error("Ledger processor has stopped")]
    Closed,

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl SubmitError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            SubmitError::ChannelFull | SubmitError::Closed => ErrorCategory::ResourceExhaustion,
            SubmitError::Ledger(err) => err.category(),
        }
    }
}

type Reply = oneshot::Sender<Result<AddOutcome, LedgerError>>;

#[derive(Debug)]
pub enum LedgerCommand {
    /// Add a block, optionally reporting the outcome
    Process { block: Block, reply: Option<Reply> },
    Shutdown,
}

/// Handle for queueing blocks to the ledger writer thread
#[derive(Debug, Clone)]
pub struct LedgerSender {
    tx: mpsc::Sender<LedgerCommand>,
}

impl LedgerSender {
    /// Creates a sender together with the receiving end a writer drains
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<LedgerCommand>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (LedgerSender { tx }, rx)
    }

    /// Queues a block without waiting; fails immediately when the channel is full
    pub fn try_submit(&self, block: Block) -> Result<(), SubmitError> {
        self.tx
            .try_send(LedgerCommand::Process { block, reply: None })
            .map_err(|err| match err {
                TrySendError::Full(_) => {
                    warn!("Ledger channel is full, dropping block");
                    SubmitError::ChannelFull
                }
                TrySendError::Closed(_) => SubmitError::Closed,
            })
    }

    /// Queues a block, waiting for channel capacity and then for the outcome
    pub async fn submit(&self, block: Block) -> Result<AddOutcome, SubmitError> {
        let (reply, outcome) = oneshot::channel();
        self.tx
            .send(LedgerCommand::Process {
                block,
                reply: Some(reply),
            })
            .await
            .map_err(|_| SubmitError::Closed)?;

        let result = outcome.await.map_err(|_| SubmitError::Closed)?;
        Ok(result?)
    }

    /// Asks the writer to stop after the commands already queued
    pub async fn shutdown(&self) {
        if self.tx.send(LedgerCommand::Shutdown).await.is_err() {
            info!("Ledger processor already stopped");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Owns the ledger on a dedicated thread, applying commands in arrival order
pub struct LedgerProcessor;

impl LedgerProcessor {
    /// Moves `ledger` onto a new writer thread
    ///
    /// # Arguments
    ///
    /// * `ledger` - The ledger to own
    /// * `capacity` - Number of commands the channel buffers
    ///
    /// # Returns
    ///
    /// The sender and a handle that yields the ledger back once the thread stops
    pub fn spawn(
        ledger: Ledger,
        capacity: usize,
    ) -> std::io::Result<(LedgerSender, JoinHandle<Ledger>)> {
        let (sender, rx) = LedgerSender::channel(capacity);
        let handle = thread::Builder::new()
            .name("ledger-writer".to_string())
            .spawn(move || Self::run(ledger, rx))?;

        Ok((sender, handle))
    }

    fn run(mut ledger: Ledger, mut rx: mpsc::Receiver<LedgerCommand>) -> Ledger {
        info!("Ledger processor started");

        while let Some(command) = rx.blocking_recv() {
            match command {
                LedgerCommand::Process { block, reply } => {
                    let result = ledger.add_block(block);
                    if let Some(reply) = reply {
                        let _ = reply.send(result);
                    }
                }
                LedgerCommand::Shutdown => break,
            }
        }

        let orphans = ledger.orphan_count();
        if orphans > 0 {
            info!("Abandoning {} orphan block(s)", orphans);
        }
        if let Err(err) = ledger.flush() {
            warn!("Failed to flush ledger: {}", err);
        }

        info!("Ledger processor stopped");
        ledger
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::block::SendBlock;
    use crate::ledger::crypto::KeyPair;
    use crate::ledger::genesis::{test_keys, NetworkKind};
    use crate::ledger::storage::SledStore;
    use crate::ledger::types::Amount;
    use crate::ledger::work::{self, TEST_THRESHOLD};
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    fn new_ledger() -> Ledger {
        let kv = Arc::new(SledStore::temporary().unwrap());
        Ledger::new(kv, NetworkKind::Test, 16).unwrap()
    }

    fn genesis_send(ledger: &Ledger, balance: u128) -> Block {
        let keys = test_keys();
        let mut block = Block::Send(SendBlock {
            previous: ledger.reader().genesis(),
            destination: KeyPair::generate().public_key(),
            balance: Amount(balance),
            ..Default::default()
        });
        let cancel = AtomicBool::new(false);
        block.set_work(work::generate(&block.root(), TEST_THRESHOLD, &cancel).unwrap());
        block.sign(&keys);
        block
    }

    #[tokio::test]
    async fn test_submit_reports_outcome() {
        let ledger = new_ledger();
        let reader = ledger.reader();
        let block = genesis_send(&ledger, u128::MAX - 1);
        let hash = block.hash();

        let (sender, handle) = LedgerProcessor::spawn(ledger, 4).unwrap();

        let outcome = sender.submit(block.clone()).await.unwrap();
        assert_eq!(
            outcome,
            AddOutcome::Accepted {
                hash,
                linked_orphans: 0
            }
        );
        assert!(reader.contains(&hash).unwrap());

        assert_eq!(
            sender.submit(block).await.unwrap(),
            AddOutcome::AlreadyPresent { hash }
        );

        sender.shutdown().await;
        let ledger = handle.join().unwrap();
        assert_eq!(ledger.orphan_count(), 0);
        assert!(matches!(
            sender.submit(genesis_send(&ledger, 1)).await,
            Err(SubmitError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_rejections_come_back_to_the_caller() {
        let ledger = new_ledger();
        let mut block = genesis_send(&ledger, u128::MAX - 1);
        block.sign(&KeyPair::generate());

        let (sender, _handle) = LedgerProcessor::spawn(ledger, 4).unwrap();
        let err = sender.submit(block).await.unwrap_err();

        assert!(matches!(
            err,
            SubmitError::Ledger(LedgerError::InvalidSignature(_))
        ));
        assert_eq!(err.category(), ErrorCategory::InvalidProof);
    }

    #[test]
    fn test_try_submit_never_waits() {
        let ledger = new_ledger();
        let (sender, rx) = LedgerSender::channel(1);

        sender.try_submit(genesis_send(&ledger, 1)).unwrap();
        let err = sender.try_submit(genesis_send(&ledger, 2)).unwrap_err();
        assert!(matches!(err, SubmitError::ChannelFull));
        assert_eq!(err.category(), ErrorCategory::ResourceExhaustion);

        drop(rx);
        assert!(matches!(
            sender.try_submit(genesis_send(&ledger, 3)),
            Err(SubmitError::Closed)
        ));
    }
}
