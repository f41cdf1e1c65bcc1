//! # Summary
//!
//! This module abstracts over intra-process channels used to wire
//! together the sub-tasks of a single hosted agent (acceptor, leader,
//! scout, commander, replica). Backed by `tokio::sync::mpsc`'s unbounded
//! channel: in most cases, since we're using unbounded channels, the
//! only way for a send to fail is if the receiving end has been
//! dropped, which should be impossible unless there's some logic error
//! in the implementation. This is why the `send` method on `Tx` calls
//! `expect` internally.

use tokio::sync::mpsc;

/// Intra-server receiving channel.
#[derive(Debug)]
pub struct Rx<T>(mpsc::UnboundedReceiver<T>);

/// Intra-server transmission channel. All clones send to the same receiving end.
#[derive(derivative::Derivative)]
#[derivative(Clone(bound = ""))]
#[derive(Debug)]
pub struct Tx<T>(mpsc::UnboundedSender<T>);

/// Create a new pair of linked transmitting and receiving channels.
pub fn new<T>() -> (Tx<T>, Rx<T>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Tx(tx), Rx(rx))
}

impl<T> Tx<T> {
    /// Force a message through the channel.
    /// Panics if the receiving end has been dropped.
    pub fn send(&self, message: T) {
        self.0.send(message).ok().expect("[INTERNAL ERROR]: receiver dropped");
    }

    /// Attempt to send a message through the channel.
    /// Does nothing if the receiving end has been dropped.
    pub fn try_send(&self, message: T) {
        let _ = self.0.send(message);
    }
}

impl<T> Rx<T> {
    /// Receive the next message, or `None` once every `Tx` has dropped.
    pub async fn recv(&mut self) -> Option<T> {
        self.0.recv().await
    }

    /// Non-blocking receive, for tests driving a handle without an
    /// executor backing it.
    pub fn try_recv(&mut self) -> Option<T> {
        self.0.try_recv().ok()
    }
}
