use super::message::Message;
use crate::db::Database;
use crate::errproto;
use crate::error::{Error, Result};

use log::{info, warn};

/// The most commits sent per SYNCHRONIZE_RESPONSE. A lagging peer issues
/// repeated SYNCHRONIZE requests until it catches up; SUBSCRIPTION_APPROVED
/// sends everything at once instead, since the subscriber is already close.
const MAX_COMMITS_PER_RESPONSE: u64 = 100;

/// Fills a synchronization response for a peer that reports the given commit
/// count and hash. Emits one nested COMMIT frame per commit in the range
/// (peer count, target], sets NumCommits, and errors if the peer's history
/// diverges from ours (the caller reconnects the peer in that case).
pub fn fill_response(
    db: &dyn Database,
    peer_commit_count: u64,
    peer_hash: &str,
    target_commit: u64,
    send_all: bool,
    response: &mut Message,
) -> Result<()> {
    if peer_commit_count > db.commit_count() {
        return errproto!("you have more data than me");
    }
    if peer_commit_count > 0 {
        // The peer has some history; make sure we agree on what we share.
        let Some(our_hash) = db.commit_hash(peer_commit_count) else {
            warn!(
                "No hash for peer's commit #{peer_commit_count}, our commit count is {}",
                db.commit_count()
            );
            return errproto!("error getting hash");
        };
        if our_hash != peer_hash {
            warn!(
                "Hash mismatch: peer at commit #{peer_commit_count} with hash {peer_hash}, \
                 but we have {our_hash} for that commit"
            );
            return errproto!("hash mismatch");
        }
    }

    if peer_commit_count >= target_commit {
        info!("Peer is already synchronized");
        response.set("NumCommits", 0);
        return Ok(());
    }

    let from = peer_commit_count + 1;
    let mut to = target_commit;
    if !send_all {
        to = to.min(peer_commit_count + MAX_COMMITS_PER_RESPONSE);
    }
    let commits = db.commits(from, to).or_else(|_| errproto!("error getting commits"))?;

    info!("Synchronizing commits {from}-{to} (target {target_commit})");
    response.set("NumCommits", commits.len());
    let mut body = Vec::new();
    for (id, query, hash) in commits {
        let commit =
            Message::new("COMMIT").with("CommitIndex", id).with("Hash", hash).with_body(query);
        body.extend(commit.serialize());
    }
    response.body = body;
    Ok(())
}

/// Applies a synchronization response, committing each nested COMMIT frame
/// in order. Each commit must be the immediate successor of our local commit
/// count, and the committed hash must match the frame's hash; a mismatch is
/// fatal for this synchronization attempt.
pub fn apply_response(db: &mut dyn Database, message: &Message) -> Result<()> {
    let mut remaining = message.req_u64("NumCommits")?;

    let mut offset = 0;
    while offset < message.body.len() {
        let (commit, consumed) = Message::parse(&message.body[offset..])?;
        offset += consumed;
        if commit.method != "COMMIT" {
            return errproto!("expecting COMMIT, got {}", commit.method);
        }
        if remaining == 0 {
            return errproto!("more commits than NumCommits");
        }
        let index = commit.req_u64("CommitIndex")?;
        let hash = commit.req("Hash")?;
        if index != db.commit_count() + 1 {
            return errproto!("commit index mismatch: got {index}, want {}", db.commit_count() + 1);
        }
        if commit.body.is_empty() {
            return errproto!("blank commit #{index}");
        }
        let query = commit.body_str()?;

        // Apply the commit, retrying once if a checkpoint interrupts it.
        let mut retried = false;
        loop {
            db.wait_for_checkpoint();
            let result = db.begin().and_then(|_| {
                db.write_unmodified(query)?;
                db.prepare()
            });
            match result {
                Ok(()) => break,
                Err(Error::Checkpoint) if !retried => {
                    db.rollback();
                    retried = true;
                    info!("Retrying synchronized commit #{index} after checkpoint");
                }
                Err(error) => {
                    db.rollback();
                    return Err(error);
                }
            }
        }
        if let Err(error) = db.commit() {
            db.rollback();
            return Err(error);
        }

        if db.committed_hash() != hash {
            return errproto!(
                "hash mismatch after commit #{index}: got {}, want {hash}",
                db.committed_hash()
            );
        }
        remaining -= 1;
    }

    if remaining != 0 {
        return errproto!("{remaining} commits remaining at end");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Memory;

    fn seed(db: &mut dyn Database, n: u64) {
        for i in db.commit_count() + 1..=n {
            db.begin().unwrap();
            db.write_unmodified(&format!("INSERT INTO t VALUES ({i})")).unwrap();
            db.prepare().unwrap();
            db.commit().unwrap();
        }
    }

    fn response_for(db: &dyn Database, peer: &dyn Database, send_all: bool) -> Result<Message> {
        let mut response = Message::new("SYNCHRONIZE_RESPONSE");
        fill_response(
            db,
            peer.commit_count(),
            &peer.committed_hash(),
            db.commit_count(),
            send_all,
            &mut response,
        )?;
        Ok(response)
    }

    #[test]
    fn catches_up_a_lagging_peer() {
        let mut source = Memory::new();
        seed(&mut source, 5);
        let mut follower = Memory::new();
        seed(&mut follower, 2);

        let response = response_for(&source, &follower, false).unwrap();
        assert_eq!(response.calc_u64("NumCommits"), 3);

        apply_response(&mut follower, &response).unwrap();
        assert_eq!(follower.commit_count(), 5);
        assert_eq!(follower.committed_hash(), source.committed_hash());
    }

    #[test]
    fn already_synchronized() {
        let mut source = Memory::new();
        seed(&mut source, 3);
        let mut follower = Memory::new();
        seed(&mut follower, 3);

        let response = response_for(&source, &follower, false).unwrap();
        assert_eq!(response.calc_u64("NumCommits"), 0);
        assert!(response.body.is_empty());
        apply_response(&mut follower, &response).unwrap();
        assert_eq!(follower.commit_count(), 3);
    }

    #[test]
    fn batches_at_one_hundred_commits() {
        let mut source = Memory::new();
        seed(&mut source, 120);
        let follower = Memory::new();

        let response = response_for(&source, &follower, false).unwrap();
        assert_eq!(response.calc_u64("NumCommits"), 100);

        // send_all mode has no cap.
        let response = response_for(&source, &follower, true).unwrap();
        assert_eq!(response.calc_u64("NumCommits"), 120);
    }

    #[test]
    fn rejects_diverged_histories() {
        let mut source = Memory::new();
        seed(&mut source, 3);
        let mut forked = Memory::new();
        forked.begin().unwrap();
        forked.write_unmodified("INSERT INTO other VALUES (99)").unwrap();
        forked.prepare().unwrap();
        forked.commit().unwrap();

        assert!(response_for(&source, &forked, false).is_err());
    }

    #[test]
    fn rejects_peer_with_more_data() {
        let mut source = Memory::new();
        seed(&mut source, 2);
        let mut follower = Memory::new();
        seed(&mut follower, 4);

        let mut response = Message::new("SYNCHRONIZE_RESPONSE");
        let result = fill_response(
            &source,
            follower.commit_count(),
            &follower.committed_hash(),
            source.commit_count(),
            false,
            &mut response,
        );
        assert!(result.is_err());
    }

    #[test]
    fn rejects_numcommits_mismatch() {
        let mut source = Memory::new();
        seed(&mut source, 2);
        let mut follower = Memory::new();

        let mut response = response_for(&source, &follower, false).unwrap();
        response.set("NumCommits", 3);
        assert!(apply_response(&mut follower, &response).is_err());
    }

    #[test]
    fn retries_after_checkpoint() {
        let mut source = Memory::new();
        seed(&mut source, 2);
        let mut follower = Memory::new();

        let response = response_for(&source, &follower, false).unwrap();
        follower.inject_checkpoint();
        apply_response(&mut follower, &response).unwrap();
        assert_eq!(follower.commit_count(), 2);
        assert_eq!(follower.committed_hash(), source.committed_hash());
    }
}
