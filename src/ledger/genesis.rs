use std::sync::atomic::AtomicBool;
use std::sync::OnceLock;

use super::block::{Block, OpenBlock};
use super::crypto::KeyPair;
use super::types::{Amount, BlockHash, PublicKey, Signature, Work};
use super::work::{self, LIVE_THRESHOLD, TEST_THRESHOLD};

/// Balance credited to the genesis account
pub const GENESIS_AMOUNT: Amount = Amount::MAX;

const LIVE_ACCOUNT: [u8; 32] = [
    0xE8, 0x92, 0x08, 0xDD, 0x03, 0x8F, 0xBB, 0x26,
    0x99, 0x87, 0x68, 0x96, 0x21, 0xD5, 0x22, 0x92,
    0xAE, 0x9C, 0x35, 0x94, 0x1A, 0x74, 0x84, 0x75,
    0x6E, 0xCC, 0xED, 0x92, 0xA6, 0x50, 0x93, 0xBA,
];

const LIVE_SIGNATURE: [u8; 64] = [
    0x9F, 0x0C, 0x93, 0x3C, 0x8A, 0xDE, 0x00, 0x4D,
    0x80, 0x8E, 0xA1, 0x98, 0x5F, 0xA7, 0x46, 0xA7,
    0xE9, 0x5B, 0xA2, 0xA3, 0x8F, 0x86, 0x76, 0x40,
    0xF5, 0x3E, 0xC8, 0xF1, 0x80, 0xBD, 0xFE, 0x9E,
    0x2C, 0x12, 0x68, 0xDE, 0xAD, 0x7C, 0x26, 0x64,
    0xF3, 0x56, 0xE3, 0x7A, 0xBA, 0x36, 0x2B, 0xC5,
    0x8E, 0x46, 0xDB, 0xA0, 0x3E, 0x52, 0x3A, 0x7B,
    0x5A, 0x19, 0xE4, 0xB6, 0xEB, 0x12, 0xBB, 0x02,
];

const LIVE_WORK: u64 = 0x62f0_5417_dd3f_b691;

const TEST_PRIVATE_KEY: [u8; 32] = [
    0x34, 0xF0, 0xA3, 0x7A, 0xAD, 0x20, 0xF4, 0xA2,
    0x60, 0xF0, 0xA5, 0xB3, 0xCB, 0x3D, 0x7F, 0xB5,
    0x06, 0x73, 0x21, 0x22, 0x63, 0xE5, 0x8A, 0x38,
    0x0B, 0xC1, 0x04, 0x74, 0xBB, 0x03, 0x9C, 0xE4,
];

const TEST_SOURCE: [u8; 32] = [
    0xB0, 0x31, 0x1E, 0xA5, 0x57, 0x08, 0xD6, 0xA5,
    0x3C, 0x75, 0xCD, 0xBF, 0x88, 0x30, 0x02, 0x59,
    0xC6, 0xD0, 0x18, 0x52, 0x2F, 0xE3, 0xD4, 0xD0,
    0xA2, 0x42, 0xE4, 0x31, 0xF9, 0xE8, 0xB6, 0xD0,
];

static TEST_GENESIS: OnceLock<OpenBlock> = OnceLock::new();

/// Which network the node participates in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkKind {
    Live,
    Test,
}

impl NetworkKind {
    /// Minimum work value blocks must reach on this network
    pub fn work_threshold(self) -> u64 {
        match self {
            NetworkKind::Live => LIVE_THRESHOLD,
            NetworkKind::Test => TEST_THRESHOLD,
        }
    }

    pub fn genesis(self) -> OpenBlock {
        match self {
            NetworkKind::Live => live_genesis(),
            NetworkKind::Test => test_genesis(),
        }
    }
}

impl std::fmt::Display for NetworkKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NetworkKind::Live => write!(f, "live"),
            NetworkKind::Test => write!(f, "test"),
        }
    }
}

/// The live network's genesis open block
pub fn live_genesis() -> OpenBlock {
    let account = PublicKey(LIVE_ACCOUNT);
    OpenBlock {
        source: BlockHash::from(account),
        representative: account,
        account,
        work: Work(LIVE_WORK),
        signature: Signature(LIVE_SIGNATURE),
    }
}

/// Key pair owning the test network's genesis account
pub fn test_keys() -> KeyPair {
    KeyPair::from_bytes(&TEST_PRIVATE_KEY)
}

/// The test network's genesis open block, signed and carrying valid work
pub fn test_genesis() -> OpenBlock {
    TEST_GENESIS
        .get_or_init(|| {
            let keys = test_keys();
            let mut open = OpenBlock {
                source: BlockHash(TEST_SOURCE),
                representative: keys.public_key(),
                account: keys.public_key(),
                ..Default::default()
            };

            let cancel = AtomicBool::new(false);
            let root = BlockHash::from(open.account);
            if let Some(work) = work::generate(&root, TEST_THRESHOLD, &cancel) {
                open.work = work;
            }
            open.signature = keys.sign(&Block::Open(open.clone()).hash());
            open
        })
        .clone()
}
