use crate::errdata;
use crate::error::{Error, Result};

use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};

/// A locally committed transaction: (commit id, query, hash).
pub type CommittedTransaction = (u64, String, String);

/// The SQL engine seam. The node drives the engine through explicit
/// begin/write/prepare/commit/rollback steps so that a transaction can be
/// prepared, voted on by peers, and only then committed or rolled back.
///
/// A handle owns its uncommitted transaction state; the committed store is
/// shared between all forks of the same engine. Commits are serialized by
/// the engine's [`CommitLock`], which callers hold across the whole voting
/// phase on the leader and across each replicated commit on followers.
///
/// Committed transactions that have not yet been broadcast to peers
/// accumulate in an unsent buffer, drained by the leader at well-defined
/// points via [`Database::drain_committed`].
pub trait Database: Send {
    /// Begins a transaction. Errors if one is already open on this handle.
    fn begin(&mut self) -> Result<()>;

    /// Applies a query inside the open transaction, exactly as written
    /// (replication must not rewrite or reorder anything). May return
    /// Error::Checkpoint, in which case the caller rolls back, waits via
    /// wait_for_checkpoint(), and retries once.
    fn write_unmodified(&mut self, query: &str) -> Result<()>;

    /// Prepares the open transaction, fixing its uncommitted hash.
    fn prepare(&mut self) -> Result<()>;

    /// Commits the prepared transaction. Returns Error::Busy on a commit
    /// conflict, in which case the transaction remains open for rollback.
    fn commit(&mut self) -> Result<()>;

    /// Rolls back any open transaction. A no-op without one.
    fn rollback(&mut self);

    /// The number of committed transactions.
    fn commit_count(&self) -> u64;

    /// The hash at the latest commit, or empty with no commits.
    fn committed_hash(&self) -> String;

    /// The hash of the prepared transaction, or empty before prepare().
    fn uncommitted_hash(&self) -> String;

    /// The query text of the open transaction.
    fn uncommitted_query(&self) -> String;

    /// True if this handle has an open transaction.
    fn inside_transaction(&self) -> bool;

    /// The hash at the given 1-based commit id, if committed.
    fn commit_hash(&self, id: u64) -> Option<String>;

    /// The committed transactions in the inclusive id range.
    fn commits(&self, from: u64, to: u64) -> Result<Vec<CommittedTransaction>>;

    /// Blocks until any in-progress checkpoint completes.
    fn wait_for_checkpoint(&self);

    /// True if the unsent-transaction buffer is non-empty.
    fn has_unsent(&self) -> bool;

    /// Drains and returns the unsent-transaction buffer, in commit order.
    fn drain_committed(&mut self) -> Vec<CommittedTransaction>;

    /// The engine-wide commit lock.
    fn commit_lock(&self) -> CommitLock;

    /// A second handle onto the same committed store, for worker threads.
    fn fork(&self) -> Box<dyn Database>;
}

/// The engine-wide commit lock. A plain mutex guard can't be held across
/// update ticks (the leader acquires the lock when a commit starts and
/// releases it in a later tick), so this is an explicit acquire/release pair
/// over a mutex+condvar.
#[derive(Clone)]
pub struct CommitLock(Arc<(Mutex<bool>, Condvar)>);

impl CommitLock {
    pub fn new() -> Self {
        CommitLock(Arc::new((Mutex::new(false), Condvar::new())))
    }

    /// Blocks until the lock is free, then takes it.
    pub fn acquire(&self) {
        let (mutex, cv) = &*self.0;
        let mut held = mutex.lock().expect("commit lock poisoned");
        while *held {
            held = cv.wait(held).expect("commit lock poisoned");
        }
        *held = true;
    }

    /// Releases the lock. Panics if not held.
    pub fn release(&self) {
        let (mutex, cv) = &*self.0;
        let mut held = mutex.lock().expect("commit lock poisoned");
        assert!(*held, "releasing commit lock that isn't held");
        *held = false;
        cv.notify_all();
    }
}

impl Default for CommitLock {
    fn default() -> Self {
        Self::new()
    }
}

/// An in-memory engine. Commits form a rolling SHA-256 hash chain over the
/// query text, so two stores that applied the same transactions in the same
/// order report the same hash at every commit id. Checkpoint interrupts,
/// write failures and commit conflicts can be injected for tests.
pub struct Memory {
    shared: Arc<Shared>,
    txn: Option<Transaction>,
}

struct Shared {
    committed: RwLock<Committed>,
    lock: CommitLock,
    checkpoint_next: AtomicBool,
    conflict_next: AtomicBool,
    fail_write_next: AtomicBool,
}

#[derive(Default)]
struct Committed {
    /// (hash, query) per commit; commit ids are 1-based indexes.
    commits: Vec<(String, String)>,
    /// Committed but not yet broadcast to peers.
    unsent: Vec<CommittedTransaction>,
}

struct Transaction {
    base_count: u64,
    base_hash: String,
    queries: Vec<String>,
    prepared_hash: Option<String>,
}

/// The rolling hash: hex(SHA-256(previous hash ‖ query)).
fn chain_hash(previous: &str, query: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(previous.as_bytes());
    hasher.update(query.as_bytes());
    hex::encode(hasher.finalize())
}

impl Memory {
    pub fn new() -> Self {
        Memory {
            shared: Arc::new(Shared {
                committed: RwLock::new(Committed::default()),
                lock: CommitLock::new(),
                checkpoint_next: AtomicBool::new(false),
                conflict_next: AtomicBool::new(false),
                fail_write_next: AtomicBool::new(false),
            }),
            txn: None,
        }
    }

    /// Makes the next write_unmodified() on any handle fail with
    /// Error::Checkpoint, once.
    pub fn inject_checkpoint(&self) {
        self.shared.checkpoint_next.store(true, Ordering::SeqCst);
    }

    /// Makes the next commit() on any handle fail with Error::Busy, once.
    pub fn inject_conflict(&self) {
        self.shared.conflict_next.store(true, Ordering::SeqCst);
    }

    /// Makes the next write_unmodified() on any handle fail, once.
    pub fn inject_write_failure(&self) {
        self.shared.fail_write_next.store(true, Ordering::SeqCst);
    }
}

impl Default for Memory {
    fn default() -> Self {
        Self::new()
    }
}

impl Database for Memory {
    fn begin(&mut self) -> Result<()> {
        if self.txn.is_some() {
            return errdata!("transaction already open");
        }
        let committed = self.shared.committed.read()?;
        self.txn = Some(Transaction {
            base_count: committed.commits.len() as u64,
            base_hash: committed.commits.last().map(|(h, _)| h.clone()).unwrap_or_default(),
            queries: Vec::new(),
            prepared_hash: None,
        });
        Ok(())
    }

    fn write_unmodified(&mut self, query: &str) -> Result<()> {
        if self.shared.checkpoint_next.swap(false, Ordering::SeqCst) {
            return Err(Error::Checkpoint);
        }
        if self.shared.fail_write_next.swap(false, Ordering::SeqCst) {
            return errdata!("injected write failure");
        }
        let Some(txn) = self.txn.as_mut() else {
            return errdata!("no open transaction");
        };
        txn.queries.push(query.to_string());
        Ok(())
    }

    fn prepare(&mut self) -> Result<()> {
        let Some(txn) = self.txn.as_mut() else {
            return errdata!("no open transaction");
        };
        txn.prepared_hash = Some(chain_hash(&txn.base_hash, &txn.queries.join("\n")));
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        let Some(txn) = self.txn.as_ref() else {
            return errdata!("no open transaction");
        };
        if txn.prepared_hash.is_none() {
            return errdata!("transaction not prepared");
        }
        if self.shared.conflict_next.swap(false, Ordering::SeqCst) {
            return Err(Error::Busy);
        }
        let mut committed = self.shared.committed.write()?;
        // Another handle committed underneath us since begin().
        if committed.commits.len() as u64 != txn.base_count {
            return Err(Error::Busy);
        }
        let txn = self.txn.take().expect("checked above");
        let query = txn.queries.join("\n");
        let hash = txn.prepared_hash.expect("checked above");
        committed.commits.push((hash.clone(), query.clone()));
        let id = committed.commits.len() as u64;
        committed.unsent.push((id, query, hash));
        Ok(())
    }

    fn rollback(&mut self) {
        self.txn = None;
    }

    fn commit_count(&self) -> u64 {
        self.shared.committed.read().expect("store poisoned").commits.len() as u64
    }

    fn committed_hash(&self) -> String {
        let committed = self.shared.committed.read().expect("store poisoned");
        committed.commits.last().map(|(h, _)| h.clone()).unwrap_or_default()
    }

    fn uncommitted_hash(&self) -> String {
        self.txn.as_ref().and_then(|t| t.prepared_hash.clone()).unwrap_or_default()
    }

    fn uncommitted_query(&self) -> String {
        self.txn.as_ref().map(|t| t.queries.join("\n")).unwrap_or_default()
    }

    fn inside_transaction(&self) -> bool {
        self.txn.is_some()
    }

    fn commit_hash(&self, id: u64) -> Option<String> {
        if id == 0 {
            return None;
        }
        let committed = self.shared.committed.read().expect("store poisoned");
        committed.commits.get(id as usize - 1).map(|(h, _)| h.clone())
    }

    fn commits(&self, from: u64, to: u64) -> Result<Vec<CommittedTransaction>> {
        let committed = self.shared.committed.read()?;
        if from == 0 || to < from || to > committed.commits.len() as u64 {
            return errdata!("commit range {from}-{to} out of bounds");
        }
        Ok((from..=to)
            .map(|id| {
                let (hash, query) = &committed.commits[id as usize - 1];
                (id, query.clone(), hash.clone())
            })
            .collect())
    }

    fn wait_for_checkpoint(&self) {
        // In-memory stores never checkpoint; injected interrupts clear on use.
    }

    fn has_unsent(&self) -> bool {
        !self.shared.committed.read().expect("store poisoned").unsent.is_empty()
    }

    fn drain_committed(&mut self) -> Vec<CommittedTransaction> {
        std::mem::take(&mut self.shared.committed.write().expect("store poisoned").unsent)
    }

    fn commit_lock(&self) -> CommitLock {
        self.shared.lock.clone()
    }

    fn fork(&self) -> Box<dyn Database> {
        Box::new(Memory { shared: self.shared.clone(), txn: None })
    }
}
