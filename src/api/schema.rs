use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::ledger::storage::{PendingInfo, StoredBlock};
use crate::ledger::{AccountInfo, AddOutcome, Block, BlockHash};
use crate::network::PeerInfo;

/// A wrapper for DateTime<Utc> that implements ToSchema
/// Represents a timestamp in ISO 8601 format
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = "2023-01-01T12:00:00Z")]
pub struct DateTimeUtc(pub DateTime<Utc>);

impl From<DateTime<Utc>> for DateTimeUtc {
    fn from(dt: DateTime<Utc>) -> Self {
        DateTimeUtc(dt)
    }
}

/// State of one account chain
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct AccountResponse {
    /// The account's address
    #[schema(example = "xrb_3t6k35gi95xu6tergt6p69ck76ogmitsa8mnijtpxm9fkcm736xtoncuohr3")]
    pub address: String,

    /// Hash of the latest block in the chain
    pub head: String,

    /// Hash of the block that opened the chain
    pub open_block: String,

    /// Address of the account's representative
    pub representative: String,

    /// Balance in raw units, as a decimal string
    #[schema(example = "1000")]
    pub balance: String,

    /// Number of blocks in the chain
    pub block_count: u64,
}

impl From<AccountInfo> for AccountResponse {
    fn from(info: AccountInfo) -> Self {
        AccountResponse {
            address: info.account.address(),
            head: info.head.to_string(),
            open_block: info.open_block.to_string(),
            representative: info.representative.address(),
            balance: info.balance.to_string(),
            block_count: info.block_count,
        }
    }
}

/// A send waiting to be received
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct PendingResponse {
    /// Hash of the send block
    pub hash: String,

    /// Address of the sending account
    pub source: String,

    /// Amount in raw units
    pub amount: String,
}

impl From<(BlockHash, PendingInfo)> for PendingResponse {
    fn from((hash, info): (BlockHash, PendingInfo)) -> Self {
        PendingResponse {
            hash: hash.to_string(),
            source: info.source.address(),
            amount: info.amount.to_string(),
        }
    }
}

/// A linked block with the chain it belongs to
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct BlockResponse {
    pub hash: String,

    /// Address of the account whose chain holds the block
    pub account: String,

    /// One of `send`, `receive`, `open`, `change`, `universal`
    #[schema(example = "send")]
    pub block_type: String,

    /// Balance of the chain as of this block
    pub balance: String,

    /// The block itself
    #[schema(value_type = Object)]
    pub block: Block,
}

impl From<StoredBlock> for BlockResponse {
    fn from(stored: StoredBlock) -> Self {
        BlockResponse {
            hash: stored.block.hash().to_string(),
            account: stored.account.address(),
            block_type: stored.block.block_type().name().to_string(),
            balance: stored.balance.to_string(),
            block: stored.block,
        }
    }
}

/// Result of handing a block to the ledger
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct PublishResponse {
    pub hash: String,

    /// `accepted`, `already_present` or `parent_missing`
    pub status: String,

    /// Orphans linked as a consequence of this block
    pub linked_orphans: usize,

    /// The block the ledger is waiting for, when `status` is `parent_missing`
    pub missing: Option<String>,
}

impl From<AddOutcome> for PublishResponse {
    fn from(outcome: AddOutcome) -> Self {
        let (status, linked_orphans, missing) = match outcome {
            AddOutcome::Accepted { linked_orphans, .. } => ("accepted", linked_orphans, None),
            AddOutcome::AlreadyPresent { .. } => ("already_present", 0, None),
            AddOutcome::ParentMissing { missing, .. } => {
                ("parent_missing", 0, Some(missing.to_string()))
            }
        };

        PublishResponse {
            hash: outcome.hash().to_string(),
            status: status.to_string(),
            linked_orphans,
            missing,
        }
    }
}

/// A known peer
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct PeerResponse {
    #[schema(example = "[::ffff:10.0.0.1]:7075")]
    pub address: String,

    pub last_seen: DateTimeUtc,
}

impl From<PeerInfo> for PeerResponse {
    fn from(info: PeerInfo) -> Self {
        PeerResponse {
            address: info.address,
            last_seen: info.last_seen.into(),
        }
    }
}
