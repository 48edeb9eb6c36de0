use super::message::Message;
use super::peer::Connection;
use super::state::State;
use crate::db::Database;
use crate::errproto;
use crate::error::{Error, Result};

use log::{debug, info, warn};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Coordination state shared between the sync thread and the replication
/// workers on a follower. Each incoming BEGIN_TRANSACTION, COMMIT_TRANSACTION
/// or ROLLBACK_TRANSACTION spawns one detached worker; BEGIN workers wait for
/// the database to reach their transaction's predecessor, apply and prepare
/// it, vote, then wait for their hash to show up in the commit or rollback
/// set. COMMIT/ROLLBACK workers just record the hash and wake everyone.
///
/// At least two workers must be able to run at once: the worker holding a
/// prepared transaction needs a sibling to deliver its COMMIT. Spawning one
/// worker per message satisfies that by construction.
///
/// Lock order (after the engine commit lock): `wait` before `hashes`. The
/// sync thread's own state lives outside this struct; workers read the
/// snapshots kept here as atomics.
pub struct Replication {
    /// Guards the condition variable below.
    wait: Mutex<()>,
    /// Signaled whenever the database advances or a commit/rollback hash
    /// arrives.
    cv: Condvar,
    /// Hashes the leader has told us to commit or roll back.
    hashes: Mutex<Hashes>,
    /// Tells workers to roll back and exit.
    should_exit: AtomicBool,
    /// Number of live workers.
    live: AtomicI64,
    /// Snapshot of the node's state, for worker-side protocol checks.
    state: AtomicU8,
    /// Snapshot of the node's effective priority; 0 keeps quiet on votes.
    priority: AtomicI64,
    /// The lead peer's connection, for sending votes.
    lead: Mutex<Option<Arc<dyn Connection>>>,
    /// Node name, for logs.
    name: String,
}

#[derive(Default)]
struct Hashes {
    commit: HashSet<String>,
    rollback: HashSet<String>,
}

/// Decrements the live-worker count when a worker exits, however it exits.
struct LiveGuard(Arc<Replication>);

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.live.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Replication {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Replication {
            wait: Mutex::new(()),
            cv: Condvar::new(),
            hashes: Mutex::new(Hashes::default()),
            should_exit: AtomicBool::new(false),
            live: AtomicI64::new(0),
            state: AtomicU8::new(State::Unknown as u8),
            priority: AtomicI64::new(-1),
            lead: Mutex::new(None),
            name: name.into(),
        })
    }

    /// Updates the worker-visible state snapshot.
    pub fn set_state(&self, state: State) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// Updates the worker-visible priority snapshot.
    pub fn set_priority(&self, priority: i64) {
        self.priority.store(priority, Ordering::SeqCst);
    }

    /// Updates the lead peer connection workers vote through.
    pub fn set_lead(&self, lead: Option<Arc<dyn Connection>>) {
        *self.lead.lock().expect("lead lock poisoned") = lead;
    }

    pub fn live_workers(&self) -> i64 {
        self.live.load(Ordering::SeqCst)
    }

    /// Spawns a detached worker for one replication message.
    pub fn spawn(self: &Arc<Self>, db: Box<dyn Database>, message: Message) {
        self.live.fetch_add(1, Ordering::SeqCst);
        let rep = self.clone();
        std::thread::spawn(move || {
            let _guard = LiveGuard(rep.clone());
            let mut db = db;
            if let Err(error) = replicate(&rep, db.as_mut(), &message) {
                warn!("{}: replication worker failed: {error}", rep.name);
                db.rollback();
            }
        });
    }

    /// Tells all workers to exit, and blocks until they have. Called when
    /// the node stops FOLLOWING; any leftover commit/rollback hashes are
    /// stale afterwards and are dropped.
    pub fn stop_workers(&self) {
        self.should_exit.store(true, Ordering::SeqCst);
        {
            let _guard = self.wait.lock().expect("wait lock poisoned");
            self.cv.notify_all();
        }
        while self.live.load(Ordering::SeqCst) > 0 {
            std::thread::sleep(Duration::from_millis(10));
            self.cv.notify_all();
        }
        self.should_exit.store(false, Ordering::SeqCst);
        let mut hashes = self.hashes.lock().expect("hash lock poisoned");
        hashes.commit.clear();
        hashes.rollback.clear();
    }
}

fn now_us() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_micros() as u64).unwrap_or(0)
}

/// The worker body.
fn replicate(rep: &Arc<Replication>, db: &mut dyn Database, message: &Message) -> Result<()> {
    match message.method.as_str() {
        "BEGIN_TRANSACTION" => replicate_begin(rep, db, message),
        "COMMIT_TRANSACTION" => {
            let hash = message.req("Hash")?.to_string();
            // Hold the wait mutex while notifying so a waiter can't check
            // the sets and block between our insert and notify.
            let _guard = rep.wait.lock()?;
            rep.hashes.lock()?.commit.insert(hash);
            rep.cv.notify_all();
            Ok(())
        }
        "ROLLBACK_TRANSACTION" => {
            let hash = message.req("NewHash")?.to_string();
            let _guard = rep.wait.lock()?;
            rep.hashes.lock()?.rollback.insert(hash);
            rep.cv.notify_all();
            Ok(())
        }
        method => errproto!("unexpected replication message {method}"),
    }
}

fn replicate_begin(rep: &Arc<Replication>, db: &mut dyn Database, message: &Message) -> Result<()> {
    let id = message.req("ID")?;
    let new_count = message.req_u64("NewCount")?;
    let new_hash = message.req("NewHash")?;

    // Wait for the database to reach the predecessor of our transaction.
    // Commits are serialized by this precondition even though messages are
    // handled in parallel.
    loop {
        let guard = rep.wait.lock()?;
        if rep.should_exit.load(Ordering::SeqCst) {
            return Ok(());
        }
        if new_count == db.commit_count() + 1 {
            // The condition can't regress once met, so it's safe to run the
            // database work without the lock. Waiting with the lock held
            // would block the workers that advance the commit count.
            drop(guard);
            break;
        }
        let _unused = rep.cv.wait(guard)?;
    }

    let success = apply_begin(rep, db, message, new_hash)?;

    // Vote, unless we're a permafollower or the transaction is async (the
    // leader ignores async votes anyway).
    if rep.priority.load(Ordering::SeqCst) > 0 && !id.starts_with("ASYNC_") {
        let verb = if success { "APPROVE_TRANSACTION" } else { "DENY_TRANSACTION" };
        info!("{}: {verb} #{} ({new_hash})", rep.name, db.commit_count() + 1);
        let vote = Message::new(verb)
            .with("NewCount", db.commit_count() + 1)
            .with("NewHash", if success { db.uncommitted_hash() } else { new_hash.to_string() })
            .with("ID", id)
            .with("CommitCount", db.commit_count())
            .with("Hash", db.committed_hash());
        let lead = rep.lead.lock()?;
        match lead.as_ref() {
            Some(conn) => conn.send(&vote.serialize())?,
            None => return errproto!("no leader to vote to"),
        }
    }

    // Wait for the leader's verdict on our hash.
    loop {
        let guard = rep.wait.lock()?;
        if rep.should_exit.load(Ordering::SeqCst) {
            db.rollback();
            return Ok(());
        }
        let (commit, rollback) = {
            let hashes = rep.hashes.lock()?;
            (hashes.commit.contains(new_hash), hashes.rollback.contains(new_hash))
        };
        if !commit && !rollback {
            let _unused = rep.cv.wait(guard)?;
            continue;
        }
        drop(guard);

        let result = if commit {
            handle_commit(rep, db, new_count, new_hash)
        } else {
            handle_rollback(rep, db, message)
        };

        // Wake siblings whose commit-count precondition may now hold. The
        // wait mutex is held across the notify so none of them can miss it.
        let guard = rep.wait.lock()?;
        let mut hashes = rep.hashes.lock()?;
        if commit {
            hashes.commit.remove(new_hash);
        } else {
            hashes.rollback.remove(new_hash);
        }
        drop(hashes);
        rep.cv.notify_all();
        drop(guard);
        return result;
    }
}

/// Applies and prepares the transaction. Returns Ok(false) if the write
/// failed and we should DENY; errors on protocol violations, which abort the
/// worker without a vote. A hash mismatch against the leader means our
/// history has diverged, which is fatal for the subscription: deny and
/// reconnect to the leader.
fn apply_begin(
    rep: &Arc<Replication>,
    db: &mut dyn Database,
    message: &Message,
    new_hash: &str,
) -> Result<bool> {
    let sent_us = message.calc_u64("leaderSendTime");
    let dequeued_us = now_us();

    if State::from_u8(rep.state.load(Ordering::SeqCst)) != State::Following {
        return errproto!("not following");
    }
    if db.inside_transaction() {
        return errproto!("already in a transaction");
    }
    let query = message.body_str()?;

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
                info!("{}: retrying transaction after checkpoint", rep.name);
            }
            Err(error) => {
                warn!("{}: failed to apply transaction: {error}", rep.name);
                db.rollback();
                return Ok(false);
            }
        }
    }

    if db.uncommitted_hash() != new_hash {
        warn!(
            "{}: hash mismatch applying transaction #{}: got {}, leader sent {new_hash}; \
             reconnecting to leader",
            rep.name,
            db.commit_count() + 1,
            db.uncommitted_hash()
        );
        db.rollback();
        if let Some(lead) = rep.lead.lock().expect("lead lock poisoned").as_ref() {
            lead.reconnect();
        }
        return Ok(false);
    }

    debug!(
        "{}: replicated transaction #{}, transit {}us, applied in {}us",
        rep.name,
        message.calc_u64("NewCount"),
        dequeued_us.saturating_sub(sent_us),
        now_us().saturating_sub(dequeued_us)
    );
    Ok(true)
}

fn handle_commit(rep: &Arc<Replication>, db: &mut dyn Database, count: u64, hash: &str) -> Result<()> {
    if State::from_u8(rep.state.load(Ordering::SeqCst)) != State::Following {
        return errproto!("not following");
    }
    if !db.inside_transaction() {
        return errproto!("no outstanding transaction");
    }
    if count != db.commit_count() + 1 {
        return errproto!("commit count mismatch: got {count}, want {}", db.commit_count() + 1);
    }
    if hash != db.uncommitted_hash() {
        return errproto!("hash mismatch: got {hash}, have {}", db.uncommitted_hash());
    }

    let lock = db.commit_lock();
    lock.acquire();
    let result = db.commit();
    lock.release();
    result?;

    // We're following, so these were replicated to us; nothing to resend.
    db.drain_committed();
    info!("{}: committed follower transaction #{count} ({hash})", rep.name);
    Ok(())
}

fn handle_rollback(rep: &Arc<Replication>, db: &mut dyn Database, message: &Message) -> Result<()> {
    message.req("ID")?;
    if State::from_u8(rep.state.load(Ordering::SeqCst)) != State::Following {
        return errproto!("not following");
    }
    if !db.inside_transaction() {
        info!("{}: got ROLLBACK_TRANSACTION with no outstanding transaction", rep.name);
    }
    db.rollback();
    Ok(())
}
