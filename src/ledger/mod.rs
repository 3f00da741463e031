// Ledger module
//
// The block-lattice core:
// - Primitive types (hashes, keys, amounts, work)
// - Addresses, key pairs and signatures
// - Block variants and canonical hashing
// - Proof of work and the work pool
// - Genesis blocks per network
// - Storage, the ledger itself and its single-writer processor
// - Owner-side block building

pub mod account;
pub mod block;
pub mod chain;
pub mod crypto;
pub mod genesis;
pub mod processor;
pub mod storage;
pub mod types;
pub mod work;

// Re-export main components for easier access
pub use account::{Account, AccountError, AccountInfo};
pub use block::{Block, BlockType};
pub use chain::{AddOutcome, ErrorCategory, Ledger, LedgerError, LedgerReader};
pub use crypto::KeyPair;
pub use genesis::NetworkKind;
pub use processor::{LedgerProcessor, LedgerSender, SubmitError};
pub use storage::{KeyValueStore, SledStore};
pub use types::{Amount, BlockHash, PublicKey, Signature, Work};
pub use work::WorkPool;
