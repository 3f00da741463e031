use std::io;
use std::net::{SocketAddr, SocketAddrV6};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use log::{debug, info, warn};
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::watch;

use super::message::{KeepAlive, Message, KEEPALIVE_PEERS};
use super::peer::{to_v6, PeerTable};
use crate::ledger::block::Block;
use crate::ledger::processor::{LedgerSender, SubmitError};
use crate::ledger::types::BlockHash;

/// Largest datagram the node reads or writes
pub const PACKET_SIZE: usize = 512;

/// Peers silent for this many keepalive intervals are forgotten
const PURGE_INTERVALS: u32 = 5;

/// Errors that can occur in the UDP transport
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Socket error: {0}")]
    Io(#[from] io::Error),
}

/// What the transport did with one inbound datagram
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Undecodable or unverifiable; nothing changed
    Rejected,
    /// Keepalive merged, `learned` peers were new
    KeepAlive { learned: usize },
    /// Block queued for the ledger
    Forwarded(BlockHash),
    /// Block dropped because the ledger channel was full or closed
    Dropped(BlockHash),
}

/// UDP endpoint feeding decoded blocks to the ledger writer
pub struct UdpTransport {
    socket: UdpSocket,
    local_addr: SocketAddr,
    peers: PeerTable,
    ledger: LedgerSender,
}

impl UdpTransport {
    /// Binds the socket the node listens on
    ///
    /// # Arguments
    ///
    /// * `addr` - Local address to bind
    /// * `peers` - Peer table shared with the rest of the node
    /// * `ledger` - Channel into the ledger writer
    pub async fn bind(
        addr: SocketAddr,
        peers: PeerTable,
        ledger: LedgerSender,
    ) -> Result<Self, TransportError> {
        let socket = UdpSocket::bind(addr).await?;
        let local_addr = socket.local_addr()?;
        info!("UDP transport bound to {}", local_addr);

        Ok(UdpTransport {
            socket,
            local_addr,
            peers,
            ledger,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peers(&self) -> &PeerTable {
        &self.peers
    }

    /// Sends one message to `peer`
    pub async fn send(&self, peer: SocketAddrV6, message: &Message) -> Result<(), TransportError> {
        let bytes = message.encode();
        self.socket.send_to(&bytes, self.target(peer)).await?;
        Ok(())
    }

    /// An IPv4 socket cannot address v4-mapped peers, so unwrap them first
    fn target(&self, peer: SocketAddrV6) -> SocketAddr {
        match peer.ip().to_ipv4_mapped() {
            Some(v4) if self.local_addr.is_ipv4() => SocketAddr::from((v4, peer.port())),
            _ => SocketAddr::V6(peer),
        }
    }

    /// Broadcasts a block to every known peer
    pub async fn publish(&self, block: &Block) -> usize {
        let message = Message::Publish(block.clone());
        let peers = self.peers.peers();
        let results = join_all(peers.iter().map(|peer| self.send(*peer, &message))).await;

        Self::count_sent(&peers, results)
    }

    /// Sends every known peer a keepalive listing up to eight other peers
    pub async fn send_keepalives(&self) -> usize {
        let peers = self.peers.peers();
        let messages: Vec<Message> = peers
            .iter()
            .map(|peer| {
                let sample: Vec<SocketAddrV6> = self
                    .peers
                    .random_sample(KEEPALIVE_PEERS + 1)
                    .into_iter()
                    .filter(|other| other != peer)
                    .take(KEEPALIVE_PEERS)
                    .collect();
                Message::KeepAlive(KeepAlive::new(&sample))
            })
            .collect();

        let sends = peers
            .iter()
            .zip(&messages)
            .map(|(peer, message)| self.send(*peer, message));
        let results = join_all(sends).await;

        Self::count_sent(&peers, results)
    }

    fn count_sent(peers: &[SocketAddrV6], results: Vec<Result<(), TransportError>>) -> usize {
        let mut sent = 0;
        for (peer, result) in peers.iter().zip(results) {
            match result {
                Ok(()) => sent += 1,
                Err(err) => debug!("Failed to send to {}: {}", peer, err),
            }
        }
        sent
    }

    /// Handles one inbound datagram without waiting on the ledger
    pub fn handle_datagram(&self, source: SocketAddrV6, datagram: &[u8]) -> Dispatch {
        let message = match Message::decode(datagram) {
            Ok((_, message)) => message,
            Err(err) => {
                debug!("Dropping datagram from {}: {}", source, err);
                return Dispatch::Rejected;
            }
        };

        match message {
            Message::KeepAlive(keepalive) => {
                let learned = keepalive
                    .peers()
                    .filter(|peer| self.peers.insert(*peer))
                    .count();
                self.peers.insert(source);
                Dispatch::KeepAlive { learned }
            }
            Message::Publish(block) | Message::ConfirmReq(block) => self.forward(source, block),
            Message::ConfirmAck(vote) => {
                if !vote.verify_signature() {
                    debug!("Dropping vote with bad signature from {}", source);
                    return Dispatch::Rejected;
                }
                self.forward(source, vote.block)
            }
        }
    }

    fn forward(&self, source: SocketAddrV6, block: Block) -> Dispatch {
        let hash = block.hash();
        match self.ledger.try_submit(block) {
            Ok(()) => {
                debug!("Queued block {} from {}", hash, source);
                Dispatch::Forwarded(hash)
            }
            Err(SubmitError::Closed) => {
                debug!("Ledger stopped, dropping block {} from {}", hash, source);
                Dispatch::Dropped(hash)
            }
            Err(_) => Dispatch::Dropped(hash),
        }
    }

    /// Receives datagrams until `shutdown` flips to `true`
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut buf = [0u8; PACKET_SIZE];
        info!("Listening for peers on {}", self.local_addr);

        while !*shutdown.borrow() {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                received = self.socket.recv_from(&mut buf) => {
                    match received {
                        Ok((len, source)) => {
                            self.handle_datagram(to_v6(source), &buf[..len]);
                        }
                        Err(err) => warn!("Failed to receive datagram: {}", err),
                    }
                }
            }
        }

        info!("UDP transport stopped");
    }

    /// Gossips keepalives every `period` and forgets peers that went quiet
    pub async fn run_keepalive(self: Arc<Self>, period: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(period);
        let silence = chrono::Duration::from_std(period * PURGE_INTERVALS).ok();

        while !*shutdown.borrow() {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if let Some(silence) = silence {
                        let purged = self.peers.purge_older_than(Utc::now() - silence);
                        if purged > 0 {
                            info!("Purged {} silent peer(s)", purged);
                        }
                    }
                    let sent = self.send_keepalives().await;
                    debug!("Sent {} keepalive(s)", sent);
                }
            }
        }

        info!("Keepalive timer stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::block::SendBlock;
    use crate::ledger::crypto::KeyPair;
    use crate::ledger::processor::LedgerCommand;
    use crate::ledger::types::{Amount, Work};
    use crate::network::message::{Vote, MAGIC};
    use std::net::{Ipv4Addr, Ipv6Addr};
    use tokio::sync::mpsc;

    fn peer(last: u16) -> SocketAddrV6 {
        SocketAddrV6::new(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, last), 7075, 0, 0)
    }

    fn block(keys: &KeyPair) -> Block {
        let mut block = Block::Send(SendBlock {
            previous: BlockHash([7; 32]),
            destination: KeyPair::generate().public_key(),
            balance: Amount(500),
            ..Default::default()
        });
        block.set_work(Work(42));
        block.sign(keys);
        block
    }

    async fn transport(capacity: usize) -> (UdpTransport, mpsc::Receiver<LedgerCommand>) {
        let (sender, rx) = LedgerSender::channel(capacity);
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, 0));
        let transport = UdpTransport::bind(addr, PeerTable::new(None), sender)
            .await
            .unwrap();
        (transport, rx)
    }

    fn forwarded(rx: &mut mpsc::Receiver<LedgerCommand>) -> Option<Block> {
        match rx.try_recv() {
            Ok(LedgerCommand::Process { block, .. }) => Some(block),
            _ => None,
        }
    }

    #[tokio::test]
    async fn test_wrong_magic_changes_nothing() {
        let (transport, mut rx) = transport(4).await;
        transport.peers().insert(peer(1));

        let mut datagram = Message::KeepAlive(KeepAlive::new(&[peer(2), peer(3)])).encode();
        datagram[0] = b'X';
        assert_ne!(datagram[..2], MAGIC);

        assert_eq!(transport.handle_datagram(peer(4), &datagram), Dispatch::Rejected);
        assert_eq!(transport.peers().peers(), vec![peer(1)]);

        let mut publish = Message::Publish(block(&KeyPair::generate())).encode();
        publish[1] = b'X';
        assert_eq!(transport.handle_datagram(peer(4), &publish), Dispatch::Rejected);
        assert!(forwarded(&mut rx).is_none());
    }

    #[tokio::test]
    async fn test_truncated_datagram_is_rejected() {
        let (transport, mut rx) = transport(4).await;
        let datagram = Message::Publish(block(&KeyPair::generate())).encode();

        let dispatch = transport.handle_datagram(peer(1), &datagram[..datagram.len() - 1]);
        assert_eq!(dispatch, Dispatch::Rejected);
        assert!(transport.peers().is_empty());
        assert!(forwarded(&mut rx).is_none());
    }

    #[tokio::test]
    async fn test_keepalive_merges_peers() {
        let (transport, _rx) = transport(4).await;
        transport.peers().insert(peer(2));

        let datagram = Message::KeepAlive(KeepAlive::new(&[peer(2), peer(3)])).encode();
        let dispatch = transport.handle_datagram(peer(1), &datagram);

        assert_eq!(dispatch, Dispatch::KeepAlive { learned: 1 });
        assert!(transport.peers().contains(&peer(1)));
        assert!(transport.peers().contains(&peer(3)));
        assert_eq!(transport.peers().len(), 3);
    }

    #[tokio::test]
    async fn test_publish_and_confirm_req_are_forwarded() {
        let (transport, mut rx) = transport(4).await;
        let keys = KeyPair::generate();

        let published = block(&keys);
        let datagram = Message::Publish(published.clone()).encode();
        assert_eq!(
            transport.handle_datagram(peer(1), &datagram),
            Dispatch::Forwarded(published.hash())
        );
        assert_eq!(forwarded(&mut rx), Some(published));

        let requested = block(&keys);
        let datagram = Message::ConfirmReq(requested.clone()).encode();
        transport.handle_datagram(peer(1), &datagram);
        assert_eq!(forwarded(&mut rx), Some(requested));
    }

    #[tokio::test]
    async fn test_confirm_ack_forwards_the_voted_block() {
        let (transport, mut rx) = transport(4).await;
        let representative = KeyPair::generate();
        let voted = block(&KeyPair::generate());

        let vote = Vote::new(&representative, 3, voted.clone());
        let datagram = Message::ConfirmAck(vote.clone()).encode();
        assert_eq!(
            transport.handle_datagram(peer(1), &datagram),
            Dispatch::Forwarded(voted.hash())
        );
        assert_eq!(forwarded(&mut rx), Some(voted));

        let mut forged = vote;
        forged.sequence += 1;
        let datagram = Message::ConfirmAck(forged).encode();
        assert_eq!(transport.handle_datagram(peer(1), &datagram), Dispatch::Rejected);
        assert!(forwarded(&mut rx).is_none());
    }

    #[tokio::test]
    async fn test_full_channel_drops_instead_of_waiting() {
        let (transport, _rx) = transport(1).await;
        let keys = KeyPair::generate();

        let first = Message::Publish(block(&keys)).encode();
        assert!(matches!(
            transport.handle_datagram(peer(1), &first),
            Dispatch::Forwarded(_)
        ));

        let second = block(&keys);
        let datagram = Message::Publish(second.clone()).encode();
        assert_eq!(
            transport.handle_datagram(peer(1), &datagram),
            Dispatch::Dropped(second.hash())
        );
    }

    #[tokio::test]
    async fn test_keepalive_over_udp() {
        let (receiver, _rx) = transport(4).await;
        let (sender, _sender_rx) = transport(4).await;
        let receiver = Arc::new(receiver);

        let (stop, shutdown) = watch::channel(false);
        let task = tokio::spawn(receiver.clone().run(shutdown));

        sender.peers().insert(to_v6(receiver.local_addr()));
        assert_eq!(sender.send_keepalives().await, 1);

        let expected = to_v6(sender.local_addr());
        let mut seen = false;
        for _ in 0..100 {
            if receiver.peers().contains(&expected) {
                seen = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(seen);

        stop.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
