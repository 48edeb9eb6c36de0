use super::message::Message;
use super::state::State;
use crate::errinput;
use crate::error::Result;

use log::warn;
use std::collections::BTreeMap;
use std::sync::Arc;

/// A peer's index in the registry. Stable for the life of the process, and
/// used by the transport and by escalated commands instead of an ownership
/// handle.
pub type PeerId = usize;

/// A transport link to a peer. The transport owns the socket and reconnects
/// forever; the node only sends frames and occasionally asks for the link to
/// be torn down and re-established.
pub trait Connection: Send + Sync {
    /// Sends a serialized frame. A send to a disconnected peer is dropped.
    fn send(&self, frame: &[u8]) -> Result<()>;

    /// Returns true if the link is currently established.
    fn connected(&self) -> bool;

    /// Drops the link so the transport re-establishes it from scratch.
    fn reconnect(&self);

    /// Returns true if all queued outbound bytes have been flushed.
    fn send_buffer_empty(&self) -> bool {
        true
    }

    /// Returns true if an unflushed outbound frame contains the needle.
    fn has_buffered(&self, _needle: &str) -> bool {
        false
    }

    /// Most recent round-trip latency in microseconds, 0 if unmeasured.
    fn latency_us(&self) -> u64 {
        0
    }

    /// Returns and resets the (sent, received) byte counters.
    fn take_transfer_stats(&self) -> (u64, u64) {
        (0, 0)
    }
}

/// A configured cluster peer and the attributes we've learned about it.
/// Everything here is owned by the sync thread; replication workers only ever
/// see a clone of the connection handle.
///
/// The authoritative values of commit_count and hash are whatever the last
/// message from the peer reported; they are cached here in parsed form.
pub struct Peer {
    pub id: PeerId,
    pub name: String,
    pub host: String,
    /// Configured, not negotiated: a permafollower replicates but never
    /// stands for election.
    pub permafollower: bool,
    /// Last reported election priority. -1 until the peer logs in.
    pub priority: i64,
    /// Last reported state.
    pub state: State,
    /// Last reported committed transaction count.
    pub commit_count: u64,
    /// Last reported committed hash.
    pub hash: String,
    /// Last reported software version.
    pub version: String,
    pub logged_in: bool,
    /// True only on the follower ↔ leader pair, after SUBSCRIBE completes.
    pub subscribed: bool,
    /// This peer's response to our current standup attempt.
    pub standup_response: Option<bool>,
    /// This peer's vote on our current distributed transaction.
    pub transaction_response: Option<bool>,
    conn: Arc<dyn Connection>,
}

impl Peer {
    pub fn new(id: PeerId, name: String, host: String, permafollower: bool, conn: Arc<dyn Connection>) -> Self {
        Peer {
            id,
            name,
            host,
            permafollower,
            priority: -1,
            state: State::Unknown,
            commit_count: 0,
            hash: String::new(),
            version: String::new(),
            logged_in: false,
            subscribed: false,
            standup_response: None,
            transaction_response: None,
            conn,
        }
    }

    /// A full peer participates in elections and quorum; a permafollower
    /// doesn't.
    pub fn full(&self) -> bool {
        !self.permafollower
    }

    /// Sends a serialized frame if the peer is connected, otherwise drops it
    /// with a warning.
    pub fn send_frame(&self, frame: &[u8]) {
        if !self.conn.connected() {
            warn!("Can't send to disconnected peer {}, discarding frame", self.name);
            return;
        }
        if let Err(error) = self.conn.send(frame) {
            warn!("Failed sending to peer {}: {error}", self.name);
        }
    }

    /// Sends a message as-is. Callers normally go through the node so that
    /// CommitCount/Hash stamping happens first.
    pub fn send(&self, message: &Message) {
        self.send_frame(&message.serialize())
    }

    /// Clears everything learned from the peer, on disconnect or when it
    /// reverts to SEARCHING.
    pub fn reset_login(&mut self) {
        self.logged_in = false;
        self.subscribed = false;
        self.standup_response = None;
        self.transaction_response = None;
        self.state = State::Unknown;
    }

    /// Tears down the link; the transport will re-establish it and both
    /// sides will LOGIN again.
    pub fn reconnect(&mut self) {
        if self.conn.connected() {
            warn!("Reconnecting to peer {}", self.name);
            self.conn.reconnect();
        }
        self.reset_login();
    }

    pub fn connection(&self) -> Arc<dyn Connection> {
        self.conn.clone()
    }

    pub fn connected(&self) -> bool {
        self.conn.connected()
    }

    pub fn latency_us(&self) -> u64 {
        self.conn.latency_us()
    }
}

/// A parsed peer-list entry: `host:port` optionally followed by
/// `?name=value&name=value` parameters. Recognized parameters are `nodeName`
/// (display-name override, defaults to the host) and `Permafollower=true`.
#[derive(Clone, Debug, PartialEq)]
pub struct PeerConfig {
    pub name: String,
    pub host: String,
    pub permafollower: bool,
}

impl PeerConfig {
    pub fn parse(entry: &str) -> Result<PeerConfig> {
        let entry = entry.trim();
        if entry.is_empty() {
            return errinput!("empty peer entry");
        }
        let (host, query) = entry.split_once('?').unwrap_or((entry, ""));
        let mut params = BTreeMap::new();
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
            params.insert(name.to_string(), value.to_string());
        }
        let name = params.get("nodeName").cloned().unwrap_or_else(|| host.to_string());
        let permafollower = params.get("Permafollower").map(|v| v == "true").unwrap_or(false);
        Ok(PeerConfig { name, host: host.to_string(), permafollower })
    }

    /// Parses a comma-separated peer list.
    pub fn parse_list(list: &str) -> Result<Vec<PeerConfig>> {
        list.split(',').filter(|e| !e.trim().is_empty()).map(PeerConfig::parse).collect()
    }
}
