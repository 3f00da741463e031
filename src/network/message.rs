use std::net::{Ipv6Addr, SocketAddrV6};

use blake2b_simd::Params;
use thiserror::Error;

use crate::ledger::block::{
    Block, BlockType, ChangeBlock, OpenBlock, ReceiveBlock, SendBlock, UniversalBlock,
};
use crate::ledger::crypto::{verify_signature, KeyPair};
use crate::ledger::types::{Amount, BlockHash, PublicKey, Signature, Work};

pub const MAGIC: [u8; 2] = *b"RC";
pub const VERSION_MAX: u8 = 0x06;
pub const VERSION_USING: u8 = 0x06;
pub const VERSION_MIN: u8 = 0x06;

pub const HEADER_SIZE: usize = 8;
pub const KEEPALIVE_PEERS: usize = 8;
const PEER_RECORD_SIZE: usize = 18;
const KEEPALIVE_SIZE: usize = KEEPALIVE_PEERS * PEER_RECORD_SIZE;
const VOTE_PREFIX_SIZE: usize = 32 + 64 + 8;

/// Block type byte for messages that carry no block
const BLOCK_NOT_A_BLOCK: u8 = 1;

/// Errors that can occur while decoding wire messages
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("Message truncated: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("Message oversized: expected {expected} bytes, got {actual}")]
    Oversized { expected: usize, actual: usize },

    #[error("Wrong magic number: {0:02x?}")]
    BadMagic([u8; 2]),

    #[error("Unknown message type: {0}")]
    UnknownMessageType(u8),

    #[error("Unsupported message type: {0:?}")]
    Unsupported(MessageType),

    #[error("Unknown block type: {0}")]
    UnknownBlockType(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Invalid,
    NotAType,
    KeepAlive,
    Publish,
    ConfirmReq,
    ConfirmAck,
    BulkPull,
    BulkPush,
    FrontierReq,
}

impl MessageType {
    pub fn code(self) -> u8 {
        match self {
            MessageType::Invalid => 0,
            MessageType::NotAType => 1,
            MessageType::KeepAlive => 2,
            MessageType::Publish => 3,
            MessageType::ConfirmReq => 4,
            MessageType::ConfirmAck => 5,
            MessageType::BulkPull => 6,
            MessageType::BulkPush => 7,
            MessageType::FrontierReq => 8,
        }
    }

    pub fn from_code(code: u8) -> Result<Self, CodecError> {
        match code {
            0 => Ok(MessageType::Invalid),
            1 => Ok(MessageType::NotAType),
            2 => Ok(MessageType::KeepAlive),
            3 => Ok(MessageType::Publish),
            4 => Ok(MessageType::ConfirmReq),
            5 => Ok(MessageType::ConfirmAck),
            6 => Ok(MessageType::BulkPull),
            7 => Ok(MessageType::BulkPush),
            8 => Ok(MessageType::FrontierReq),
            other => Err(CodecError::UnknownMessageType(other)),
        }
    }
}

/// The 8-byte frame header every datagram starts with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub magic: [u8; 2],
    pub version_max: u8,
    pub version_using: u8,
    pub version_min: u8,
    pub message_type: MessageType,
    pub extensions: u8,
    pub block_type: u8,
}

impl Header {
    pub fn new(message_type: MessageType, block_type: u8) -> Self {
        Header {
            magic: MAGIC,
            version_max: VERSION_MAX,
            version_using: VERSION_USING,
            version_min: VERSION_MIN,
            message_type,
            extensions: 0,
            block_type,
        }
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.magic);
        out.extend_from_slice(&[
            self.version_max,
            self.version_using,
            self.version_min,
            self.message_type.code(),
            self.extensions,
            self.block_type,
        ]);
    }

    /// Decodes the header at the start of `buf`, checking the magic number
    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        if buf.len() < HEADER_SIZE {
            return Err(CodecError::Truncated {
                expected: HEADER_SIZE,
                actual: buf.len(),
            });
        }

        let magic = [buf[0], buf[1]];
        if magic != MAGIC {
            return Err(CodecError::BadMagic(magic));
        }

        Ok(Header {
            magic,
            version_max: buf[2],
            version_using: buf[3],
            version_min: buf[4],
            message_type: MessageType::from_code(buf[5])?,
            extensions: buf[6],
            block_type: buf[7],
        })
    }
}

/// Cursor over a borrowed buffer; every read is bounds-checked
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        let end = self.pos + N;
        if end > self.buf.len() {
            return Err(CodecError::Truncated {
                expected: end,
                actual: self.buf.len(),
            });
        }

        let mut out = [0u8; N];
        out.copy_from_slice(&self.buf[self.pos..end]);
        self.pos = end;
        Ok(out)
    }

    fn hash(&mut self) -> Result<BlockHash, CodecError> {
        self.take::<32>().map(BlockHash)
    }

    fn key(&mut self) -> Result<PublicKey, CodecError> {
        self.take::<32>().map(PublicKey)
    }

    fn amount(&mut self) -> Result<Amount, CodecError> {
        self.take::<16>().map(Amount::from_be_bytes)
    }

    fn signature(&mut self) -> Result<Signature, CodecError> {
        self.take::<64>().map(Signature)
    }

    fn work(&mut self) -> Result<Work, CodecError> {
        self.take::<8>().map(Work::from_wire_bytes)
    }

    fn rest(&mut self) -> &'a [u8] {
        let rest = &self.buf[self.pos..];
        self.pos = self.buf.len();
        rest
    }

    /// Fails if any bytes are left unread
    fn finish(&self) -> Result<(), CodecError> {
        if self.pos != self.buf.len() {
            return Err(CodecError::Oversized {
                expected: self.pos,
                actual: self.buf.len(),
            });
        }
        Ok(())
    }
}

/// Size of a block body on the wire, signature and work included
pub fn block_body_size(block_type: BlockType) -> usize {
    match block_type {
        BlockType::Send => 152,
        BlockType::Receive => 136,
        BlockType::Open => 168,
        BlockType::Change => 136,
        BlockType::Universal => 232,
    }
}

/// Appends the block's wire body: variant fields, then signature, then work
pub fn encode_block_body(block: &Block, out: &mut Vec<u8>) {
    match block {
        Block::Send(b) => {
            out.extend_from_slice(b.previous.as_bytes());
            out.extend_from_slice(b.destination.as_bytes());
            out.extend_from_slice(&b.balance.to_be_bytes());
        }
        Block::Receive(b) => {
            out.extend_from_slice(b.previous.as_bytes());
            out.extend_from_slice(b.source.as_bytes());
        }
        Block::Open(b) => {
            out.extend_from_slice(b.source.as_bytes());
            out.extend_from_slice(b.representative.as_bytes());
            out.extend_from_slice(b.account.as_bytes());
        }
        Block::Change(b) => {
            out.extend_from_slice(b.previous.as_bytes());
            out.extend_from_slice(b.representative.as_bytes());
        }
        Block::Universal(b) => {
            out.extend_from_slice(b.account.as_bytes());
            out.extend_from_slice(b.previous.as_bytes());
            out.extend_from_slice(b.representative.as_bytes());
            out.extend_from_slice(&b.balance.to_be_bytes());
            out.extend_from_slice(&b.amount.to_be_bytes());
            out.extend_from_slice(b.link.as_bytes());
        }
    }
    out.extend_from_slice(block.signature().as_bytes());
    out.extend_from_slice(&block.work().to_wire_bytes());
}

fn read_block(block_type: BlockType, reader: &mut Reader<'_>) -> Result<Block, CodecError> {
    let block = match block_type {
        BlockType::Send => Block::Send(SendBlock {
            previous: reader.hash()?,
            destination: reader.key()?,
            balance: reader.amount()?,
            signature: reader.signature()?,
            work: reader.work()?,
        }),
        BlockType::Receive => Block::Receive(ReceiveBlock {
            previous: reader.hash()?,
            source: reader.hash()?,
            signature: reader.signature()?,
            work: reader.work()?,
        }),
        BlockType::Open => Block::Open(OpenBlock {
            source: reader.hash()?,
            representative: reader.key()?,
            account: reader.key()?,
            signature: reader.signature()?,
            work: reader.work()?,
        }),
        BlockType::Change => Block::Change(ChangeBlock {
            previous: reader.hash()?,
            representative: reader.key()?,
            signature: reader.signature()?,
            work: reader.work()?,
        }),
        BlockType::Universal => Block::Universal(UniversalBlock {
            account: reader.key()?,
            previous: reader.hash()?,
            representative: reader.key()?,
            balance: reader.amount()?,
            amount: reader.amount()?,
            link: reader.hash()?,
            signature: reader.signature()?,
            work: reader.work()?,
        }),
    };

    Ok(block)
}

/// Decodes a block body that must fill `body` exactly
pub fn decode_block_body(block_type: BlockType, body: &[u8]) -> Result<Block, CodecError> {
    let expected = block_body_size(block_type);
    if body.len() < expected {
        return Err(CodecError::Truncated {
            expected,
            actual: body.len(),
        });
    }
    if body.len() > expected {
        return Err(CodecError::Oversized {
            expected,
            actual: body.len(),
        });
    }

    let mut reader = Reader::new(body);
    let block = read_block(block_type, &mut reader)?;
    reader.finish()?;
    Ok(block)
}

/// Block-type byte followed by the wire body
pub fn encode_block(block: &Block) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + block_body_size(block.block_type()));
    out.push(block.block_type().code());
    encode_block_body(block, &mut out);
    out
}

pub fn decode_block(bytes: &[u8]) -> Result<Block, CodecError> {
    let (code, body) = bytes.split_first().ok_or(CodecError::Truncated {
        expected: 1,
        actual: 0,
    })?;
    let block_type =
        BlockType::from_code(*code).map_err(|_| CodecError::UnknownBlockType(*code))?;
    decode_block_body(block_type, body)
}

/// Peer list gossiped between nodes, always eight slots on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeepAlive {
    pub peers: [SocketAddrV6; KEEPALIVE_PEERS],
}

impl KeepAlive {
    /// Builds a keepalive from up to eight peers, padding with `[::]:0`
    pub fn new(peers: &[SocketAddrV6]) -> Self {
        let mut slots = [SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, 0, 0, 0); KEEPALIVE_PEERS];
        for (slot, peer) in slots.iter_mut().zip(peers) {
            *slot = *peer;
        }
        KeepAlive { peers: slots }
    }

    /// Peers in the message, skipping empty slots
    pub fn peers(&self) -> impl Iterator<Item = SocketAddrV6> + '_ {
        self.peers
            .iter()
            .copied()
            .filter(|peer| !peer.ip().is_unspecified() && peer.port() != 0)
    }

    fn encode(&self, out: &mut Vec<u8>) {
        for peer in &self.peers {
            out.extend_from_slice(&peer.ip().octets());
            out.extend_from_slice(&peer.port().to_le_bytes());
        }
    }

    fn decode(body: &[u8]) -> Result<Self, CodecError> {
        if body.len() != KEEPALIVE_SIZE {
            return Err(if body.len() < KEEPALIVE_SIZE {
                CodecError::Truncated {
                    expected: KEEPALIVE_SIZE,
                    actual: body.len(),
                }
            } else {
                CodecError::Oversized {
                    expected: KEEPALIVE_SIZE,
                    actual: body.len(),
                }
            });
        }

        let mut reader = Reader::new(body);
        let mut peers = [SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, 0, 0, 0); KEEPALIVE_PEERS];
        for peer in peers.iter_mut() {
            let ip = Ipv6Addr::from(reader.take::<16>()?);
            let port = u16::from_le_bytes(reader.take::<2>()?);
            *peer = SocketAddrV6::new(ip, port, 0, 0);
        }
        reader.finish()?;

        Ok(KeepAlive { peers })
    }
}

/// A representative's signed vote for a block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vote {
    pub account: PublicKey,
    pub signature: Signature,
    pub sequence: u64,
    pub block: Block,
}

impl Vote {
    /// Builds and signs a vote for `block`
    pub fn new(keys: &KeyPair, sequence: u64, block: Block) -> Self {
        let mut vote = Vote {
            account: keys.public_key(),
            signature: Signature::ZERO,
            sequence,
            block,
        };
        vote.signature = keys.sign(&vote.hash());
        vote
    }

    /// blake2b-256(block hash || sequence)
    pub fn hash(&self) -> BlockHash {
        let hash = Params::new()
            .hash_length(32)
            .to_state()
            .update(self.block.hash().as_bytes())
            .update(&self.sequence.to_le_bytes())
            .finalize();

        let mut out = [0u8; 32];
        out.copy_from_slice(hash.as_bytes());
        BlockHash(out)
    }

    pub fn verify_signature(&self) -> bool {
        verify_signature(self.hash().as_bytes(), &self.signature, &self.account)
    }

    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.account.as_bytes());
        out.extend_from_slice(self.signature.as_bytes());
        out.extend_from_slice(&self.sequence.to_le_bytes());
        encode_block_body(&self.block, out);
    }

    fn decode(block_type: BlockType, body: &[u8]) -> Result<Self, CodecError> {
        let mut reader = Reader::new(body);
        let account = reader.key()?;
        let signature = reader.signature()?;
        let sequence = u64::from_le_bytes(reader.take::<8>()?);
        let block = decode_block_body(block_type, reader.rest()).map_err(|err| match err {
            CodecError::Truncated { expected, actual } => CodecError::Truncated {
                expected: expected + VOTE_PREFIX_SIZE,
                actual: actual + VOTE_PREFIX_SIZE,
            },
            CodecError::Oversized { expected, actual } => CodecError::Oversized {
                expected: expected + VOTE_PREFIX_SIZE,
                actual: actual + VOTE_PREFIX_SIZE,
            },
            other => other,
        })?;

        Ok(Vote {
            account,
            signature,
            sequence,
            block,
        })
    }
}

/// Messages exchanged over UDP
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive(KeepAlive),
    Publish(Block),
    ConfirmReq(Block),
    ConfirmAck(Vote),
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::KeepAlive(_) => MessageType::KeepAlive,
            Message::Publish(_) => MessageType::Publish,
            Message::ConfirmReq(_) => MessageType::ConfirmReq,
            Message::ConfirmAck(_) => MessageType::ConfirmAck,
        }
    }

    /// Header this node writes for the message
    pub fn header(&self) -> Header {
        let block_type = match self {
            Message::KeepAlive(_) => BLOCK_NOT_A_BLOCK,
            Message::Publish(block) | Message::ConfirmReq(block) => block.block_type().code(),
            Message::ConfirmAck(vote) => vote.block.block_type().code(),
        };
        Header::new(self.message_type(), block_type)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_SIZE + KEEPALIVE_SIZE);
        self.header().encode(&mut out);

        match self {
            Message::KeepAlive(keepalive) => keepalive.encode(&mut out),
            Message::Publish(block) | Message::ConfirmReq(block) => {
                encode_block_body(block, &mut out)
            }
            Message::ConfirmAck(vote) => vote.encode(&mut out),
        }
        out
    }

    /// Decodes a whole datagram; nothing is returned unless every byte is consumed
    pub fn decode(buf: &[u8]) -> Result<(Header, Message), CodecError> {
        let header = Header::decode(buf)?;
        let body = &buf[HEADER_SIZE..];

        let message = match header.message_type {
            MessageType::KeepAlive => Message::KeepAlive(KeepAlive::decode(body)?),
            MessageType::Publish => {
                Message::Publish(decode_block_body(block_type_of(&header)?, body)?)
            }
            MessageType::ConfirmReq => {
                Message::ConfirmReq(decode_block_body(block_type_of(&header)?, body)?)
            }
            MessageType::ConfirmAck => {
                Message::ConfirmAck(Vote::decode(block_type_of(&header)?, body)?)
            }
            other => return Err(CodecError::Unsupported(other)),
        };

        Ok((header, message))
    }
}

fn block_type_of(header: &Header) -> Result<BlockType, CodecError> {
    BlockType::from_code(header.block_type)
        .map_err(|_| CodecError::UnknownBlockType(header.block_type))
}
