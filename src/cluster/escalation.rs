use super::command::Command;
use super::message::Message;
use super::node::Server;

use log::{info, warn};
use std::collections::BTreeMap;

/// The commands this follower has escalated to the leader and is awaiting
/// responses for. One owner at a time: a command is either held here or by
/// the command server, never both. Escalations are deduped by command id; a
/// retried escalation for an id we're already tracking replaces the old
/// entry.
#[derive(Default)]
pub struct Escalations {
    commands: BTreeMap<String, Command>,
}

impl Escalations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Tracks an escalated command until its response arrives.
    pub fn insert(&mut self, command: Command) {
        if self.commands.insert(command.id.clone(), command).is_some() {
            warn!("Replacing already-escalated command, duplicate id?");
        }
    }

    /// Removes and returns the command with the given id, if tracked.
    pub fn remove(&mut self, id: &str) -> Option<Command> {
        self.commands.remove(id)
    }

    /// Returns all outstanding commands to the server for retry, e.g. when
    /// the leader is lost. The commands are not complete; the server will
    /// re-escalate them to the next leader.
    pub fn requeue_all(&mut self, server: &mut dyn Server) {
        for (id, command) in std::mem::take(&mut self.commands) {
            info!("Re-queueing escalated command {id} ({})", command.request.method);
            server.accept_command(command, false);
        }
    }

    /// Abandons all outstanding commands with a synthesized 500 response,
    /// when a graceful shutdown times out.
    pub fn abandon_all(&mut self, server: &mut dyn Server) {
        if self.commands.is_empty() {
            return;
        }
        warn!("Abandoning {} escalated commands", self.commands.len());
        for (_, mut command) in std::mem::take(&mut self.commands) {
            command.respond(Message::new("500 Abandoned"));
            server.accept_command(command, false);
        }
    }

    /// The method lines of all outstanding requests, for diagnostics.
    pub fn request_methods(&self) -> Vec<String> {
        self.commands.values().map(|c| c.request.method.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::node::tests::TestServer;

    fn command(id: &str) -> Command {
        Command::new(id, Message::new("Query").with("Query", "SELECT 1"))
    }

    #[test]
    fn remove_returns_tracked_commands() {
        let mut escalations = Escalations::new();
        escalations.insert(command("a"));
        escalations.insert(command("b"));
        assert_eq!(escalations.len(), 2);

        let removed = escalations.remove("a").unwrap();
        assert_eq!(removed.id, "a");
        assert!(escalations.remove("a").is_none());
        assert!(!escalations.is_empty());
    }

    #[test]
    fn requeue_hands_commands_back_incomplete() {
        let mut escalations = Escalations::new();
        escalations.insert(command("a"));
        escalations.insert(command("b"));

        let mut server = TestServer::new();
        escalations.requeue_all(&mut server);
        assert!(escalations.is_empty());

        let requeued = server.take_accepted();
        assert_eq!(requeued.len(), 2);
        assert!(requeued.iter().all(|(command, is_new)| !command.complete && !is_new));
    }

    #[test]
    fn abandon_synthesizes_responses() {
        let mut escalations = Escalations::new();
        escalations.insert(command("a"));

        let mut server = TestServer::new();
        escalations.abandon_all(&mut server);
        assert!(escalations.is_empty());

        let abandoned = server.take_accepted();
        assert_eq!(abandoned.len(), 1);
        let (command, is_new) = &abandoned[0];
        assert!(command.complete);
        assert!(!is_new);
        assert_eq!(command.response.as_ref().unwrap().method, "500 Abandoned");
    }
}
