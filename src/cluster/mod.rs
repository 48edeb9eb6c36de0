//! The cluster layer: a set of identical peers maintaining one logical SQL
//! database. At most one peer leads and serializes all writes; the others
//! follow and replicate its transactions, escalating their own write
//! commands to it. See [`Node`] for the state machine that ties it together.

mod command;
mod escalation;
mod message;
mod node;
mod peer;
mod replication;
mod state;
mod synchronize;

pub use command::Command;
pub use message::Message;
pub use node::{Node, Options, Server};
pub use peer::{Connection, Peer, PeerConfig, PeerId};
pub use state::{CommitState, Consistency, State};
