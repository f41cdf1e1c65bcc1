//! # Summary
//!
//! Owns the set of live links, keyed by peer `BoxID`: dials peers with a
//! lexicographically smaller box that are currently down, listens for
//! inbound connections, and exposes the liveness view and the unicast/
//! broadcast/master-channel operations (`4.2`). Grounded in
//! `server/linkManager.go`'s `markAsUp`/`markAsDown`/`isUp`/
//! `getAllUp`/`getAllDown`/`broadcast`/`dialForConnections`/
//! `listenForConnections`/`connectAndHandleMaster`.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

use crate::channel;
use crate::failure_detector::FailureDetector;
use crate::identity::BoxID;
use crate::link::{self, Link, LinkEvent};

const DIAL_RETRY_INTERVAL: Duration = Duration::from_secs(1);
const DIAL_TIMEOUT: Duration = Duration::from_millis(200);

/// An inbound transport-level message, tagged with the box it arrived
/// from: `<sender peer box>, <payload after the "msg " tag>`.
pub type Inbound = (BoxID, String);

/// An inbound `chatroom` frame, tagged with the box it arrived from and
/// carrying the rest of the line verbatim (`<sender-box> <text>`), for
/// the master control channel's `get`/`broadcast` pair (`6`).
pub type Chat = (BoxID, String);

pub struct LinkManager {
    my_box: BoxID,
    peers: RwLock<HashMap<BoxID, Option<Link>>>,
    leader_flag: Arc<AtomicBool>,
    failure_detector: Arc<FailureDetector>,
    inbound_tx: channel::Tx<Inbound>,
    chat_tx: channel::Tx<Chat>,
}

impl LinkManager {
    /// Builds a manager pre-populated with every peer box mentioned in
    /// the configuration (excluding `my_box`), all initially down.
    pub fn new(
        my_box: BoxID,
        peer_boxes: impl IntoIterator<Item = BoxID>,
        leader_flag: Arc<AtomicBool>,
        failure_detector: Arc<FailureDetector>,
    ) -> (Arc<Self>, channel::Rx<Inbound>, channel::Rx<Chat>) {
        let (inbound_tx, inbound_rx) = channel::new();
        let (chat_tx, chat_rx) = channel::new();
        let peers = peer_boxes.into_iter().filter(|peer| *peer != my_box).map(|peer| (peer, None)).collect();
        let manager = Arc::new(LinkManager {
            my_box,
            peers: RwLock::new(peers),
            leader_flag,
            failure_detector,
            inbound_tx,
            chat_tx,
        });
        (manager, inbound_rx, chat_rx)
    }

    /// Registers `link` as the live link to `peer`. Fatal if a link is
    /// already registered: the at-most-one-live-link invariant (`4.2`)
    /// was violated by a caller, which is a programming-contract error.
    fn mark_up(&self, peer: BoxID, link: Link) {
        let mut peers = self.peers.write();
        match peers.get(&peer) {
            None => panic!("[INTERNAL ERROR]: link manager has no entry for peer {}", peer),
            Some(Some(_)) => panic!("[INTERNAL ERROR]: link to {} already established", peer),
            Some(None) => {}
        }
        peers.insert(peer, Some(link));
    }

    pub fn mark_down(&self, peer: &BoxID) {
        if let Some(slot) = self.peers.write().get_mut(peer) {
            *slot = None;
        }
        self.failure_detector.note_down(peer);
    }

    pub fn is_up(&self, peer: &BoxID) -> bool {
        self.peers.read().get(peer).map(Option::is_some).unwrap_or(false)
    }

    pub fn alive_set(&self) -> Vec<BoxID> {
        let mut alive: Vec<BoxID> =
            self.peers.read().iter().filter(|(_, link)| link.is_some()).map(|(peer, _)| peer.clone()).collect();
        alive.push(self.my_box.clone());
        alive.sort();
        alive
    }

    pub fn dead_set(&self) -> Vec<BoxID> {
        let mut dead: Vec<BoxID> =
            self.peers.read().iter().filter(|(_, link)| link.is_none()).map(|(peer, _)| peer.clone()).collect();
        dead.sort();
        dead
    }

    pub fn all_peers(&self) -> Vec<BoxID> {
        self.peers.read().keys().cloned().collect()
    }

    /// Writes `msg <payload>` to `peer`'s link if up; silently drops
    /// otherwise. Re-transmission is the caller's (Replica's)
    /// responsibility.
    pub fn send(&self, peer: &BoxID, payload: &str) {
        if let Some(Some(link)) = self.peers.read().get(peer) {
            link.send(format!("msg {}", payload));
        }
    }

    /// Fans `payload` out to every up peer. Local delivery is the
    /// Router's job, not the Link Manager's.
    pub fn broadcast(&self, payload: &str) {
        for link in self.peers.read().values().flatten() {
            link.send(format!("msg {}", payload));
        }
    }

    /// Master `broadcast <text>` (`6`): fans `chatroom <my-box> <text>`
    /// out to every up peer, on its own wire tag so it never collides
    /// with structured Paxos transport frames.
    pub fn broadcast_chat(&self, text: &str) {
        let line = format!("chatroom {} {}", self.my_box, text);
        for link in self.peers.read().values().flatten() {
            link.send(line.clone());
        }
    }

    /// Periodically dials every down peer whose box sorts before ours.
    /// Combined with the accept side's at-most-one-live-link check, this
    /// asymmetric rule gives a unique live link per pair once both sides
    /// are up.
    pub async fn dial_loop(self: Arc<Self>) {
        loop {
            let candidates: Vec<BoxID> = {
                let peers = self.peers.read();
                peers
                    .iter()
                    .filter(|(peer, link)| link.is_none() && **peer < self.my_box)
                    .map(|(peer, _)| peer.clone())
                    .collect()
            };

            for peer in candidates {
                if self.is_up(&peer) {
                    continue;
                }
                let dial = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(peer.addr())).await;
                if let Ok(Ok(stream)) = dial {
                    self.spawn_link(stream, Some(peer));
                }
            }

            tokio::time::sleep(DIAL_RETRY_INTERVAL).await;
        }
    }

    /// Accepts inbound peer connections indefinitely.
    pub async fn listen_loop(self: Arc<Self>) -> io::Result<()> {
        let listener = TcpListener::bind(self.my_box.addr()).await?;
        loop {
            let (stream, _) = listener.accept().await?;
            self.spawn_link(stream, None);
        }
    }

    /// Spawns the link's own tasks, then a small supervisor task that
    /// owns this link's private event stream: for a dialed link the peer
    /// is already known and registered immediately (mirroring the
    /// original's `newLinkKnownOther`); for an accepted link, the first
    /// `Alive` event both learns and registers the peer.
    fn spawn_link(self: &Arc<Self>, stream: TcpStream, known_peer: Option<BoxID>) {
        let (events_tx, events_rx) = channel::new();
        let link = link::spawn(stream, self.my_box.clone(), known_peer.clone(), self.leader_flag.clone(), events_tx);

        if let Some(peer) = &known_peer {
            if self.is_up(peer) {
                link.close();
                return;
            }
            self.mark_up(peer.clone(), link.clone());
        }

        let manager = self.clone();
        tokio::spawn(manager.supervise(known_peer, link, events_rx));
    }

    async fn supervise(self: Arc<Self>, mut known_peer: Option<BoxID>, link: Link, mut events: channel::Rx<LinkEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                LinkEvent::Alive { peer, leader } => {
                    if known_peer.is_none() {
                        if self.is_up(&peer) {
                            // Late duplicate: another link already won registration.
                            link.close();
                            return;
                        }
                        self.mark_up(peer.clone(), link.clone());
                        known_peer = Some(peer.clone());
                    }
                    self.failure_detector.note_alive(peer, leader);
                }
                LinkEvent::Msg(payload) => {
                    if let Some(peer) = &known_peer {
                        self.inbound_tx.try_send((peer.clone(), payload));
                    }
                }
                LinkEvent::Chat(text) => {
                    if let Some(peer) = &known_peer {
                        self.chat_tx.try_send((peer.clone(), text));
                    }
                }
                LinkEvent::Down(_) => {
                    if let Some(peer) = known_peer.take() {
                        self.mark_down(&peer);
                    }
                    return;
                }
            }
        }
    }

    /// Listens for exactly one controller connection on `master_addr` and
    /// hands the text lines it sends to `master_rx`; never returns unless
    /// the listener itself fails. The caller drives `master_rx` to
    /// implement `get`/`alive`/`broadcast`/`crash` (`6`).
    pub async fn connect_master(
        self: Arc<Self>,
        master_addr: std::net::SocketAddr,
    ) -> io::Result<(channel::Rx<String>, channel::Tx<String>)> {
        let listener = TcpListener::bind(master_addr).await?;
        let (stream, _) = listener.accept().await?;
        let (read_half, write_half) = tokio::io::split(stream);

        let (inbound_tx, inbound_rx) = channel::new::<String>();
        tokio::spawn(async move {
            let mut lines = BufReader::new(read_half).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                inbound_tx.try_send(line);
            }
        });

        let (outbound_tx, mut outbound_rx) = channel::new::<String>();
        tokio::spawn(async move {
            let mut write_half = write_half;
            while let Some(line) = outbound_rx.recv().await {
                let mut frame = line.into_bytes();
                frame.push(b'\n');
                if write_half.write_all(&frame).await.is_err() {
                    break;
                }
            }
        });

        Ok((inbound_rx, outbound_tx))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    /// Binds an ephemeral loopback listener, connects to it, and returns
    /// the resulting (client, server) stream pair.
    async fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connect = TcpStream::connect(addr);
        let (accepted, connected) = tokio::join!(listener.accept(), connect);
        (connected.unwrap(), accepted.unwrap().0)
    }

    /// `8`'s at-most-one-live-link-per-peer safety property: `mark_up` is
    /// a fatal programming-contract violation (`4.2`/`7`) if a link to
    /// `peer` is already registered.
    #[tokio::test]
    async fn mark_up_rejects_a_second_live_link_to_the_same_peer() {
        let my_box: BoxID = "127.0.0.1:19990".parse().unwrap();
        let peer: BoxID = "127.0.0.1:19991".parse().unwrap();
        let failure_detector = Arc::new(FailureDetector::new());
        let leader_flag = Arc::new(AtomicBool::new(false));
        let (manager, _inbound, _chat) =
            LinkManager::new(my_box.clone(), vec![peer.clone()], leader_flag.clone(), failure_detector);

        let (stream_a, _keep_a) = tcp_pair().await;
        let (events_tx, _events_rx) = channel::new();
        let link_a = link::spawn(stream_a, my_box.clone(), Some(peer.clone()), leader_flag.clone(), events_tx.clone());
        manager.mark_up(peer.clone(), link_a);
        assert!(manager.is_up(&peer));

        let (stream_b, _keep_b) = tcp_pair().await;
        let link_b = link::spawn(stream_b, my_box.clone(), Some(peer.clone()), leader_flag, events_tx);

        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| manager.mark_up(peer.clone(), link_b)));
        assert!(outcome.is_err(), "a second mark_up for the same peer must panic");
    }
}
