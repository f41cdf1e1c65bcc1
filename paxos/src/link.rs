//! # Summary
//!
//! A `Link` is one full-duplex, newline-framed byte stream to exactly one
//! peer box. It owns a pinger, a writer, and a reader task, and reports
//! what it observes (liveness, inbound `msg` payloads, death) to whoever
//! spawned it via a channel of `LinkEvent`s — the Link Manager, in
//! practice. Grounded in the original `server/link.go`'s `link` struct
//! (`runPinger`/`runCheckState`/`doRcvPing`/`doRcvMsg`), rewritten against
//! `tokio::io`'s line-oriented async reader instead of a blocking
//! `bufio.Reader`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Notify;

use crate::channel;
use crate::identity::BoxID;

/// Default interval between pings and the base unit of the reader's
/// death-detection grace period (`2 * PING_INTERVAL`).
pub const PING_INTERVAL: Duration = Duration::from_millis(500);

/// What a link observed on its stream, destined for the Link Manager.
#[derive(Clone, Debug)]
pub enum LinkEvent {
    /// A ping was received. `peer` is learned from the ping's payload the
    /// first time this fires for a freshly-accepted connection. `leader`
    /// reflects the supplemented `ping <box> [leader]` tag (`9.2`).
    Alive { peer: BoxID, leader: bool },
    /// An inbound `msg` frame, payload only (the `msg` tag already
    /// stripped). Handed to the node demultiplexer.
    Msg(String),
    /// An inbound `chatroom <sender-box> <text>` frame, payload only (the
    /// `chatroom` tag stripped). Fed to the master control channel's
    /// message log (`6`); kept on its own tag rather than reusing `msg`
    /// since `msg` now carries structured Paxos transport frames.
    Chat(String),
    /// The link died: transport error, or no frame for `2 * PING_INTERVAL`.
    /// `peer` is `None` if the link died before any ping was ever received
    /// (nothing to mark down).
    Down(Option<BoxID>),
}

/// A handle to a running link. Cloning shares the same underlying
/// transport and shutdown signal.
#[derive(Clone)]
pub struct Link {
    outbound: channel::Tx<String>,
    shutdown: Arc<Notify>,
    closed: Arc<AtomicBool>,
}

impl Link {
    /// Atomically writes a newline-terminated frame. Best-effort: if the
    /// writer task has already torn down, this is a silent no-op — the
    /// `Down` event already reported (or will report) the failure.
    pub fn send(&self, line: impl Into<String>) {
        self.outbound.try_send(line.into());
    }

    /// Idempotent. Marks the link inactive and tears down its tasks.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.shutdown.notify_waiters();
        }
    }
}

/// Spawns a link's pinger, writer, and reader over `stream`, and returns a
/// handle to it. `known_peer` is `Some` for links created by dialing (we
/// already know who we're calling); `None` for accepted connections,
/// whose peer identity is only learned from the first `ping`.
///
/// `leader_flag` is read on every tick to decide whether this node tags
/// its outbound pings with ` leader`; it is shared with the Failure
/// Detector / Replica's own leader-candidacy state.
pub fn spawn(
    stream: TcpStream,
    my_box: BoxID,
    known_peer: Option<BoxID>,
    leader_flag: Arc<AtomicBool>,
    events: channel::Tx<LinkEvent>,
) -> Link {
    let (outbound_tx, mut outbound_rx) = channel::new::<String>();
    let shutdown = Arc::new(Notify::new());
    let closed = Arc::new(AtomicBool::new(false));
    let (read_half, mut write_half) = tokio::io::split(stream);

    tokio::spawn({
        let outbound_tx = outbound_tx.clone();
        let shutdown = shutdown.clone();
        async move {
            let mut interval = tokio::time::interval(PING_INTERVAL);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let line = if leader_flag.load(Ordering::Relaxed) {
                            format!("ping {} leader", my_box)
                        } else {
                            format!("ping {}", my_box)
                        };
                        outbound_tx.try_send(line);
                    }
                    _ = shutdown.notified() => break,
                }
            }
        }
    });

    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            loop {
                tokio::select! {
                    next = outbound_rx.recv() => {
                        match next {
                            Some(line) => {
                                let mut frame = line.into_bytes();
                                frame.push(b'\n');
                                if write_half.write_all(&frame).await.is_err() {
                                    shutdown.notify_waiters();
                                    break;
                                }
                            }
                            None => break,
                        }
                    }
                    _ = shutdown.notified() => break,
                }
            }
        }
    });

    tokio::spawn({
        let events = events.clone();
        let shutdown = shutdown.clone();
        let mut known_peer = known_peer;
        async move {
            let mut lines = BufReader::new(read_half).lines();
            loop {
                let outcome = tokio::select! {
                    outcome = tokio::time::timeout(PING_INTERVAL * 2, lines.next_line()) => outcome,
                    _ = shutdown.notified() => break,
                };
                match outcome {
                    Ok(Ok(Some(line))) => {
                        let mut fields = line.splitn(2, ' ');
                        match fields.next() {
                            Some("ping") => {
                                let rest = fields.next().unwrap_or_default();
                                let mut payload = rest.split(' ');
                                let box_token = payload.next().unwrap_or_default();
                                let leader = payload.next() == Some("leader");
                                match box_token.parse::<BoxID>() {
                                    Ok(peer) => {
                                        known_peer = Some(peer.clone());
                                        events.try_send(LinkEvent::Alive { peer, leader });
                                    }
                                    Err(_) => log::debug!("dropping malformed ping: {:?}", line),
                                }
                            }
                            Some("msg") => {
                                events.try_send(LinkEvent::Msg(fields.next().unwrap_or_default().to_string()));
                            }
                            Some("chatroom") => {
                                events.try_send(LinkEvent::Chat(fields.next().unwrap_or_default().to_string()));
                            }
                            _ => log::debug!("dropping unrecognized frame: {:?}", line),
                        }
                    }
                    // EOF or transport error: the peer is gone.
                    Ok(Ok(None)) | Ok(Err(_)) => break,
                    // No frame for 2 * PING_INTERVAL.
                    Err(_) => {
                        log::debug!("link to {:?} timed out", known_peer);
                        break;
                    }
                }
            }
            shutdown.notify_waiters();
            events.try_send(LinkEvent::Down(known_peer));
        }
    });

    Link { outbound: outbound_tx, shutdown, closed }
}
