use blake2b_simd::Params;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::crypto::{verify_signature, KeyPair};
use super::types::{Amount, BlockHash, PublicKey, Signature, Work};
use super::work;

/// Errors describing structurally invalid blocks
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BlockError {
    #[error("Block references an all-zero previous hash")]
    ZeroPrevious,

    #[error("Block references an all-zero source hash")]
    ZeroSource,

    #[error("Invalid universal block: {0}")]
    InvalidUniversal(String),

    #[error("Unknown block type: {0}")]
    UnknownType(u8),
}

/// Block variants with their numeric protocol codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockType {
    Send,
    Receive,
    Open,
    Change,
    Universal,
}

impl BlockType {
    pub fn code(self) -> u8 {
        match self {
            BlockType::Send => 2,
            BlockType::Receive => 3,
            BlockType::Open => 4,
            BlockType::Change => 5,
            BlockType::Universal => 6,
        }
    }

    pub fn from_code(code: u8) -> Result<Self, BlockError> {
        match code {
            2 => Ok(BlockType::Send),
            3 => Ok(BlockType::Receive),
            4 => Ok(BlockType::Open),
            5 => Ok(BlockType::Change),
            6 => Ok(BlockType::Universal),
            other => Err(BlockError::UnknownType(other)),
        }
    }

    /// Lower-case name, matching the JSON `type` tag
    pub fn name(self) -> &'static str {
        match self {
            BlockType::Send => "send",
            BlockType::Receive => "receive",
            BlockType::Open => "open",
            BlockType::Change => "change",
            BlockType::Universal => "universal",
        }
    }
}

/// First block of an account chain, receiving the send that funded it
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenBlock {
    pub source: BlockHash,
    pub representative: PublicKey,
    pub account: PublicKey,
    pub work: Work,
    pub signature: Signature,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendBlock {
    pub previous: BlockHash,
    pub destination: PublicKey,
    /// Balance of the sending account after the send
    pub balance: Amount,
    pub work: Work,
    pub signature: Signature,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiveBlock {
    pub previous: BlockHash,
    pub source: BlockHash,
    pub work: Work,
    pub signature: Signature,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeBlock {
    pub previous: BlockHash,
    pub representative: PublicKey,
    pub work: Work,
    pub signature: Signature,
}

/// Self-describing block carrying the full account state
///
/// The top bit of `amount` marks a send of the remaining bits to `link`
/// (read as a public key). A non-zero `amount` without the flag receives the
/// send identified by `link`. Zero `amount` and zero `link` only updates the
/// representative. A zero `previous` opens the account.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UniversalBlock {
    pub account: PublicKey,
    pub previous: BlockHash,
    pub representative: PublicKey,
    pub balance: Amount,
    pub amount: Amount,
    pub link: BlockHash,
    pub work: Work,
    pub signature: Signature,
}

pub const SEND_FLAG: u128 = 1 << 127;

impl UniversalBlock {
    pub fn is_send(&self) -> bool {
        self.amount.raw() & SEND_FLAG != 0
    }

    pub fn is_receive(&self) -> bool {
        !self.is_send() && self.amount.raw() != 0
    }

    /// Amount moved by this block, without the send flag
    pub fn magnitude(&self) -> Amount {
        Amount(self.amount.raw() & !SEND_FLAG)
    }

    pub fn destination(&self) -> PublicKey {
        PublicKey::from(self.link)
    }

    pub fn is_open(&self) -> bool {
        self.previous.is_zero()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Block {
    Open(OpenBlock),
    Send(SendBlock),
    Receive(ReceiveBlock),
    Change(ChangeBlock),
    Universal(UniversalBlock),
}

/// Blake2b-256 over the raw concatenation of the given fields
fn hash_fields(fields: &[&[u8]]) -> BlockHash {
    let mut state = Params::new().hash_length(32).to_state();
    for field in fields {
        state.update(field);
    }

    let mut out = [0u8; 32];
    out.copy_from_slice(state.finalize().as_bytes());
    BlockHash(out)
}

impl Block {
    pub fn block_type(&self) -> BlockType {
        match self {
            Block::Open(_) => BlockType::Open,
            Block::Send(_) => BlockType::Send,
            Block::Receive(_) => BlockType::Receive,
            Block::Change(_) => BlockType::Change,
            Block::Universal(_) => BlockType::Universal,
        }
    }

    /// Canonical block hash, computed from the raw field bytes in preimage order
    pub fn hash(&self) -> BlockHash {
        match self {
            Block::Open(b) => hash_fields(&[
                b.source.as_bytes(),
                b.representative.as_bytes(),
                b.account.as_bytes(),
            ]),
            Block::Send(b) => hash_fields(&[
                b.previous.as_bytes(),
                b.destination.as_bytes(),
                &b.balance.to_be_bytes(),
            ]),
            Block::Receive(b) => hash_fields(&[b.previous.as_bytes(), b.source.as_bytes()]),
            Block::Change(b) => {
                hash_fields(&[b.previous.as_bytes(), b.representative.as_bytes()])
            }
            Block::Universal(b) => hash_fields(&[
                b.account.as_bytes(),
                b.previous.as_bytes(),
                b.representative.as_bytes(),
                &b.balance.to_be_bytes(),
                &b.amount.to_be_bytes(),
                b.link.as_bytes(),
            ]),
        }
    }

    /// The value proof-of-work is computed against
    pub fn root(&self) -> BlockHash {
        match self {
            Block::Open(b) => BlockHash::from(b.account),
            Block::Send(b) => b.previous,
            Block::Receive(b) => b.previous,
            Block::Change(b) => b.previous,
            Block::Universal(b) if b.is_open() => BlockHash::from(b.account),
            Block::Universal(b) => b.previous,
        }
    }

    /// Previous block in the same chain, `None` for chain-opening blocks
    pub fn previous(&self) -> Option<BlockHash> {
        match self {
            Block::Open(_) => None,
            Block::Send(b) => Some(b.previous),
            Block::Receive(b) => Some(b.previous),
            Block::Change(b) => Some(b.previous),
            Block::Universal(b) if b.is_open() => None,
            Block::Universal(b) => Some(b.previous),
        }
    }

    /// Send block this block receives, if any
    pub fn source(&self) -> Option<BlockHash> {
        match self {
            Block::Open(b) => Some(b.source),
            Block::Receive(b) => Some(b.source),
            Block::Universal(b) if b.is_receive() => Some(b.link),
            _ => None,
        }
    }

    /// Hashes that must be in the ledger before this block can link, in lookup order
    pub fn dependencies(&self) -> Vec<BlockHash> {
        self.previous().into_iter().chain(self.source()).collect()
    }

    /// Owning account when the block names it explicitly
    pub fn account(&self) -> Option<PublicKey> {
        match self {
            Block::Open(b) => Some(b.account),
            Block::Universal(b) => Some(b.account),
            _ => None,
        }
    }

    pub fn representative(&self) -> Option<PublicKey> {
        match self {
            Block::Open(b) => Some(b.representative),
            Block::Change(b) => Some(b.representative),
            Block::Universal(b) => Some(b.representative),
            _ => None,
        }
    }

    pub fn work(&self) -> Work {
        match self {
            Block::Open(b) => b.work,
            Block::Send(b) => b.work,
            Block::Receive(b) => b.work,
            Block::Change(b) => b.work,
            Block::Universal(b) => b.work,
        }
    }

    pub fn set_work(&mut self, work: Work) {
        match self {
            Block::Open(b) => b.work = work,
            Block::Send(b) => b.work = work,
            Block::Receive(b) => b.work = work,
            Block::Change(b) => b.work = work,
            Block::Universal(b) => b.work = work,
        }
    }

    pub fn signature(&self) -> Signature {
        match self {
            Block::Open(b) => b.signature,
            Block::Send(b) => b.signature,
            Block::Receive(b) => b.signature,
            Block::Change(b) => b.signature,
            Block::Universal(b) => b.signature,
        }
    }

    pub fn set_signature(&mut self, signature: Signature) {
        match self {
            Block::Open(b) => b.signature = signature,
            Block::Send(b) => b.signature = signature,
            Block::Receive(b) => b.signature = signature,
            Block::Change(b) => b.signature = signature,
            Block::Universal(b) => b.signature = signature,
        }
    }

    /// Signs the block hash with the owner's key
    pub fn sign(&mut self, keys: &KeyPair) {
        let signature = keys.sign(&self.hash());
        self.set_signature(signature);
    }

    /// Checks the signature against the chain owner's key
    ///
    /// Send, receive and change blocks don't carry their account, so the
    /// caller resolves it from the chain.
    pub fn verify_signature(&self, signer: &PublicKey) -> bool {
        verify_signature(self.hash().as_bytes(), &self.signature(), signer)
    }

    /// Checks the block's work against its root
    pub fn has_valid_work(&self, threshold: u64) -> bool {
        work::validate(self.work(), &self.root(), threshold)
    }

    /// Rejects all-zero links and inconsistent universal blocks
    ///
    /// The genesis open block never passes through here.
    pub fn check_structure(&self) -> Result<(), BlockError> {
        match self {
            Block::Open(b) if b.source.is_zero() => Err(BlockError::ZeroSource),
            Block::Send(b) if b.previous.is_zero() => Err(BlockError::ZeroPrevious),
            Block::Change(b) if b.previous.is_zero() => Err(BlockError::ZeroPrevious),
            Block::Receive(b) if b.previous.is_zero() => Err(BlockError::ZeroPrevious),
            Block::Receive(b) if b.source.is_zero() => Err(BlockError::ZeroSource),
            Block::Universal(b) => {
                let has_amount = b.magnitude() != Amount::ZERO;
                if has_amount && b.link.is_zero() {
                    return Err(BlockError::InvalidUniversal("amount without link".to_string()));
                }
                if !has_amount && !b.link.is_zero() {
                    return Err(BlockError::InvalidUniversal("link without amount".to_string()));
                }
                if b.is_open() && !b.is_receive() {
                    return Err(BlockError::InvalidUniversal(
                        "opening block must receive".to_string(),
                    ));
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_blocks(keys: &KeyPair) -> Vec<Block> {
        let previous = BlockHash([1u8; 32]);
        let source = BlockHash([2u8; 32]);
        let other = KeyPair::generate().public_key();

        vec![
            Block::Open(OpenBlock {
                source,
                representative: other,
                account: keys.public_key(),
                ..Default::default()
            }),
            Block::Send(SendBlock {
                previous,
                destination: other,
                balance: Amount(500),
                ..Default::default()
            }),
            Block::Receive(ReceiveBlock {
                previous,
                source,
                ..Default::default()
            }),
            Block::Change(ChangeBlock {
                previous,
                representative: other,
                ..Default::default()
            }),
            Block::Universal(UniversalBlock {
                account: keys.public_key(),
                previous,
                representative: other,
                balance: Amount(400),
                amount: Amount(SEND_FLAG | 100),
                link: BlockHash::from(other),
                ..Default::default()
            }),
        ]
    }

    #[test]
    fn test_sign_then_verify_every_variant() {
        let keys = KeyPair::generate();
        let stranger = KeyPair::generate();

        for mut block in sample_blocks(&keys) {
            block.sign(&keys);
            assert!(block.verify_signature(&keys.public_key()));
            assert!(!block.verify_signature(&stranger.public_key()));
        }
    }

    #[test]
    fn test_hash_ignores_work_and_signature() {
        let keys = KeyPair::generate();
        let mut block = sample_blocks(&keys).remove(1);
        let hash = block.hash();

        block.set_work(Work(42));
        block.sign(&keys);
        assert_eq!(block.hash(), hash);

        if let Block::Send(send) = &mut block {
            send.balance = Amount(501);
        }
        assert_ne!(block.hash(), hash);
    }

    #[test]
    fn test_tampered_block_fails_verification() {
        let keys = KeyPair::generate();
        let mut block = sample_blocks(&keys).remove(2);
        block.sign(&keys);

        if let Block::Receive(receive) = &mut block {
            receive.source = BlockHash([9u8; 32]);
        }
        assert!(!block.verify_signature(&keys.public_key()));
    }

    #[test]
    fn test_root_and_dependencies() {
        let keys = KeyPair::generate();
        let blocks = sample_blocks(&keys);

        assert_eq!(blocks[0].root(), BlockHash::from(keys.public_key()));
        assert_eq!(blocks[0].dependencies(), vec![BlockHash([2u8; 32])]);
        assert_eq!(blocks[1].root(), BlockHash([1u8; 32]));
        assert_eq!(
            blocks[2].dependencies(),
            vec![BlockHash([1u8; 32]), BlockHash([2u8; 32])]
        );
        assert_eq!(blocks[4].dependencies(), vec![BlockHash([1u8; 32])]);
    }

    #[test]
    fn test_universal_open_root_is_account() {
        let keys = KeyPair::generate();
        let block = Block::Universal(UniversalBlock {
            account: keys.public_key(),
            amount: Amount(10),
            link: BlockHash([5u8; 32]),
            ..Default::default()
        });

        assert_eq!(block.root(), BlockHash::from(keys.public_key()));
        assert_eq!(block.previous(), None);
        assert_eq!(block.source(), Some(BlockHash([5u8; 32])));
        assert!(block.check_structure().is_ok());
    }

    #[test]
    fn test_zero_links_are_rejected() {
        let send = Block::Send(SendBlock::default());
        assert_eq!(send.check_structure(), Err(BlockError::ZeroPrevious));

        let open = Block::Open(OpenBlock::default());
        assert_eq!(open.check_structure(), Err(BlockError::ZeroSource));

        let universal = Block::Universal(UniversalBlock {
            previous: BlockHash([1u8; 32]),
            amount: Amount(SEND_FLAG | 5),
            ..Default::default()
        });
        assert!(universal.check_structure().is_err());
    }

    #[test]
    fn test_json_uses_type_tag() {
        let keys = KeyPair::generate();
        let mut block = sample_blocks(&keys).remove(0);
        block.set_work(Work(0x1234));

        let json = serde_json::to_value(&block).unwrap();
        assert_eq!(json["type"], "open");
        assert_eq!(json["account"], keys.address());
        assert_eq!(json["work"], "0000000000001234");

        let parsed: Block = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, block);
    }
}
