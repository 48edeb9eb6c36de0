use super::message::Message;
use super::peer::PeerId;

use std::time::Instant;

/// A client command routed through the cluster. Commands are created by the
/// command server; a follower wraps write commands in ESCALATE frames and
/// holds them in its escalation map until the leader responds. One owner at
/// a time: the command moves between the server and the node, never both.
#[derive(Clone, Debug)]
pub struct Command {
    /// Client-supplied id, unique for the life of the command. Used to match
    /// escalation responses, and to dedupe retried escalations.
    pub id: String,
    /// The original request frame.
    pub request: Message,
    /// The response frame, once complete.
    pub response: Option<Message>,
    /// True once a response (or abandonment) has been attached.
    pub complete: bool,
    /// The peer that escalated this command to us, if any.
    pub initiating_peer: Option<PeerId>,
    /// True if this command has ever been escalated to a leader.
    pub escalated: bool,
    /// When the current escalation round-trip began.
    pub escalated_at: Option<Instant>,
}

impl Command {
    pub fn new(id: impl Into<String>, request: Message) -> Self {
        Command {
            id: id.into(),
            request,
            response: None,
            complete: false,
            initiating_peer: None,
            escalated: false,
            escalated_at: None,
        }
    }

    /// Attaches a response and marks the command complete.
    pub fn respond(&mut self, response: Message) {
        self.response = Some(response);
        self.complete = true;
    }
}
