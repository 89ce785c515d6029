//! Transaction scopes
//!
//! Each thread owns one transaction frame. A [`Transaction`] is an RAII
//! scope over that frame: beginning one moves the thread from `NONE` to
//! `WORK`, and the outermost scope's exit drives the rest of the stage
//! machine.
//!
//! ## Nesting
//!
//! Nested scopes flatten into the outermost one. They share its pool, undo
//! log and lock list:
//! - An inner commit only leaves the nesting level.
//! - An inner abort rolls back the whole transaction at once, releases
//!   every registered lock and moves the stage to `ONABORT`. The enclosing
//!   scopes can no longer do transactional work, and the outermost one
//!   reports [`Error::Aborted`] when it ends.
//!
//! A scope that ends while a deeper one is still open aborts the whole
//! transaction. Every scope still counts down once, so the last one to end
//! finishes the abort and the thread returns to `NONE`.
//!
//! ## Exit sequence
//!
//! ```text
//! commit: persist new objects -> publish them -> persist snapshots
//!         -> release locks -> deferred frees
//!         -> ONCOMMIT callbacks -> FINALLY callbacks -> NONE
//! abort:  restore snapshots -> release locks -> free allocations
//!         -> ONABORT callbacks -> FINALLY callbacks -> NONE
//! ```

use crate::lock::{release_all, HeldLock, TxLock};
use crate::log::UndoLog;
use crate::stage::TxStage;
use pmkit_core::{Error, LockFault, PoolRef, Result};
use std::cell::RefCell;
use std::marker::PhantomData;
use std::mem;
use std::ptr::NonNull;
use tracing::{debug, error, warn};

type Callback = Box<dyn FnOnce()>;

#[derive(Default)]
struct Callbacks {
    on_commit: Vec<Callback>,
    on_abort: Vec<Callback>,
    on_finally: Vec<Callback>,
}

#[derive(Default)]
struct Frame {
    stage: TxStage,
    depth: usize,
    pool: Option<PoolRef>,
    log: UndoLog,
    locks: Vec<HeldLock>,
    callbacks: Callbacks,
    abort_reason: Option<String>,
}

thread_local! {
    static FRAME: RefCell<Frame> = RefCell::new(Frame::default());
}

fn with_frame<R>(f: impl FnOnce(&mut Frame) -> R) -> R {
    FRAME.with(|frame| f(&mut frame.borrow_mut()))
}

pub(crate) fn stage() -> TxStage {
    with_frame(|f| f.stage)
}

fn set_stage(stage: TxStage) {
    with_frame(|f| f.stage = stage);
}

fn run_callbacks(callbacks: Vec<Callback>) {
    for callback in callbacks {
        callback();
    }
}

/// Fail unless the thread is in `WORK` on `pool`
pub(crate) fn require_work(pool: &PoolRef, op: &str) -> Result<()> {
    with_frame(|f| {
        if f.stage != TxStage::Work {
            return Err(Error::Scope(format!(
                "refusing to {op} outside of transaction scope (stage {})",
                f.stage
            )));
        }
        match &f.pool {
            Some(active) if active.id() == pool.id() => Ok(()),
            Some(active) => Err(Error::Scope(format!(
                "refusing to {op} in pool {} while a transaction is active on pool {}",
                pool.id(),
                active.id()
            ))),
            None => Err(Error::Scope(format!("refusing to {op}: frame has no pool"))),
        }
    })
}

pub(crate) fn record_alloc(ptr: NonNull<u8>, len: usize, flush: bool) {
    with_frame(|f| f.log.record_alloc(ptr, len, flush));
}

pub(crate) fn record_free(ptr: NonNull<u8>) -> bool {
    with_frame(|f| f.log.record_free(ptr))
}

pub(crate) fn is_freed(ptr: NonNull<u8>) -> bool {
    with_frame(|f| f.log.is_freed(ptr))
}

/// Snapshot `len` bytes of the active transaction's pool
pub(crate) fn record_range(addr: NonNull<u8>, len: usize) -> Result<()> {
    with_frame(|f| {
        if f.stage != TxStage::Work {
            return Err(Error::Scope(format!(
                "refusing to snapshot outside of transaction scope (stage {})",
                f.stage
            )));
        }
        let pool = f
            .pool
            .as_ref()
            .ok_or_else(|| Error::Scope("snapshot without a pool".to_string()))?;

        let start = addr.as_ptr() as usize;
        let inside = len == 0
            || (pool.contains(start)
                && start
                    .checked_add(len - 1)
                    .map_or(false, |last| pool.contains(last)));
        if !inside {
            return Err(Error::Scope(format!(
                "snapshot of {len} bytes at {start:#x} is outside the transaction's pool"
            )));
        }
        // SAFETY: the range lies inside the mapped pool
        unsafe { f.log.record_range(addr, len) };
        Ok(())
    })
}

/// Register `lock` with the active transaction, acquiring it
///
/// A lock that is already registered is not acquired again.
pub fn register_lock(lock: &(dyn TxLock + 'static)) -> Result<()> {
    let addr = lock as *const dyn TxLock as *const u8 as usize;
    let held = with_frame(|f| {
        if f.stage != TxStage::Work {
            return Err(Error::Scope(format!(
                "refusing to add a lock outside of transaction scope (stage {})",
                f.stage
            )));
        }
        if !f.pool.as_ref().map_or(false, |p| p.contains(addr)) {
            return Err(Error::lock(
                LockFault::NotInPool,
                "transaction lock must live in the transaction's pool",
            ));
        }
        Ok(f.locks.iter().any(|l| l.addr() == addr))
    })?;
    if held {
        return Ok(());
    }

    lock.tx_acquire()?;
    with_frame(|f| f.locks.push(HeldLock::new(lock)));
    debug!(kind = %lock.lock_kind(), addr, "lock added to transaction");
    Ok(())
}

/// Roll back the whole transaction and move it to `ONABORT`
fn rollback(reason: String) {
    let (log, locks, pool) = with_frame(|f| {
        (
            mem::take(&mut f.log),
            mem::take(&mut f.locks),
            f.pool.clone(),
        )
    });

    let Some(pool) = pool else {
        release_all(locks);
        set_stage(TxStage::OnAbort);
        return;
    };

    log.restore_ranges(pool.as_ref());
    release_all(locks);
    let released = log.release_allocs(pool.as_ref());

    warn!(
        pool = %pool.id(),
        reason = %reason,
        records = log.len(),
        released,
        "transaction aborted"
    );
    with_frame(|f| {
        f.abort_reason = Some(reason);
        f.stage = TxStage::OnAbort;
    });
}

fn commit_outermost() {
    let (log, locks, pool) = with_frame(|f| {
        (
            mem::take(&mut f.log),
            mem::take(&mut f.locks),
            f.pool.clone(),
        )
    });

    let (published, freed) = match &pool {
        Some(pool) => {
            let published = log.publish_allocs(pool.as_ref());
            log.persist_ranges(pool.as_ref());
            release_all(locks);
            (published, log.apply_frees(pool.as_ref()))
        }
        None => {
            release_all(locks);
            (0, 0)
        }
    };
    debug!(
        records = log.len(),
        published,
        freed,
        empty = log.is_empty(),
        "transaction committed"
    );

    let on_commit = with_frame(|f| {
        f.stage = TxStage::OnCommit;
        mem::take(&mut f.callbacks.on_commit)
    });
    run_callbacks(on_commit);
    finish();
}

fn end_aborted_outermost() -> Error {
    let on_abort = with_frame(|f| mem::take(&mut f.callbacks.on_abort));
    run_callbacks(on_abort);
    let reason = with_frame(|f| f.abort_reason.take());
    finish();
    Error::Aborted(reason.unwrap_or_else(|| "transaction aborted".to_string()))
}

/// FINALLY callbacks, then reset the frame to `NONE`
fn finish() {
    let on_finally = with_frame(|f| {
        f.stage = TxStage::Finally;
        mem::take(&mut f.callbacks.on_finally)
    });
    run_callbacks(on_finally);
    let frame = with_frame(mem::take);
    // Pool handle and leftover callbacks are dropped outside the borrow
    drop(frame);
}

/// An open transaction scope
///
/// Scopes are bound to the thread that opened them and must end innermost
/// first; ending an outer scope early aborts the transaction. Dropping a
/// scope without committing aborts it too.
///
/// # Example
///
/// ```ignore
/// let mut tx = Transaction::begin(&pool)?;
/// tx.lock(&root.mutex)?;
/// let node = make_persistent(&pool, Node::new(7))?;
/// tx.snapshot(&root.head)?;
/// root.head.set(node.as_ptr());
/// tx.commit()?;
/// ```
pub struct Transaction {
    pool: PoolRef,
    depth: usize,
    done: bool,
    _not_send: PhantomData<*const ()>,
}

impl Transaction {
    /// Open a scope on `pool`, nesting into an active one if present
    pub fn begin(pool: &PoolRef) -> Result<Self> {
        let depth = with_frame(|f| match f.stage {
            TxStage::None => {
                f.stage = TxStage::Work;
                f.depth = 1;
                f.pool = Some(pool.clone());
                Ok(1)
            }
            TxStage::Work => match &f.pool {
                Some(active) if active.id() == pool.id() => {
                    f.depth += 1;
                    Ok(f.depth)
                }
                _ => Err(Error::Scope(
                    "nested transaction must use the enclosing transaction's pool".to_string(),
                )),
            },
            TxStage::OnAbort if f.depth > 0 => Err(Error::Scope(
                "enclosing transaction has already aborted".to_string(),
            )),
            other => Err(Error::Scope(format!(
                "cannot begin a transaction in stage {other}"
            ))),
        })?;

        debug!(pool = %pool.id(), depth, "transaction begin");
        Ok(Transaction {
            pool: pool.clone(),
            depth,
            done: false,
            _not_send: PhantomData,
        })
    }

    /// Open a scope and acquire `locks` for its lifetime
    ///
    /// If a lock cannot be acquired the scope is aborted and the error
    /// returned.
    pub fn begin_locked(pool: &PoolRef, locks: &[&(dyn TxLock + 'static)]) -> Result<Self> {
        let mut tx = Self::begin(pool)?;
        for lock in locks {
            if let Err(e) = tx.lock(*lock) {
                tx.abort(e.to_string());
                return Err(e);
            }
        }
        Ok(tx)
    }

    /// Pool this transaction works on
    pub fn pool(&self) -> &PoolRef {
        &self.pool
    }

    /// Nesting level of this scope, 1 for the outermost
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Current stage of the thread
    pub fn stage(&self) -> TxStage {
        stage()
    }

    /// Acquire `lock` and hold it until the transaction ends
    pub fn lock(&mut self, lock: &(dyn TxLock + 'static)) -> Result<()> {
        register_lock(lock)
    }

    /// Save the current bytes of `*value` so an abort restores them
    pub fn snapshot<T>(&mut self, value: *const T) -> Result<()> {
        self.add_range(value as *const u8, mem::size_of::<T>())
    }

    /// Save `len` bytes at `addr` so an abort restores them
    ///
    /// The range must lie inside the transaction's pool.
    pub fn add_range(&mut self, addr: *const u8, len: usize) -> Result<()> {
        let addr = NonNull::new(addr as *mut u8)
            .ok_or_else(|| Error::Scope("snapshot of a null address".to_string()))?;
        record_range(addr, len)
    }

    /// Run `f` after a successful commit, with the stage at `ONCOMMIT`
    pub fn on_commit(&mut self, f: impl FnOnce() + 'static) {
        with_frame(|frame| frame.callbacks.on_commit.push(Box::new(f)));
    }

    /// Run `f` after an abort, with the stage at `ONABORT`
    pub fn on_abort(&mut self, f: impl FnOnce() + 'static) {
        with_frame(|frame| frame.callbacks.on_abort.push(Box::new(f)));
    }

    /// Run `f` when the outermost scope ends, with the stage at `FINALLY`
    pub fn on_finally(&mut self, f: impl FnOnce() + 'static) {
        with_frame(|frame| frame.callbacks.on_finally.push(Box::new(f)));
    }

    /// Roll back the whole transaction
    ///
    /// The stage moves to `ONABORT` immediately and every registered lock is
    /// released. The scope stays open until it is dropped or committed,
    /// which then reports [`Error::Aborted`].
    pub fn abort(&mut self, reason: impl Into<String>) {
        if stage() == TxStage::Work {
            rollback(reason.into());
        }
    }

    /// Leave the scope
    ///
    /// For the outermost scope this commits: new objects are persisted and
    /// published, snapshots persisted, locks released, deferred frees
    /// performed and the callbacks run. An inner scope only leaves its
    /// nesting level. If the transaction was aborted this finishes the abort
    /// and returns [`Error::Aborted`]. Committing a scope that is not the
    /// innermost one aborts the transaction and fails with a scope error.
    pub fn commit(mut self) -> Result<()> {
        self.done = true;
        self.end(true)
    }

    fn end(&mut self, commit: bool) -> Result<()> {
        let (stage, depth) = with_frame(|f| (f.stage, f.depth));
        if depth != self.depth {
            return self.end_out_of_order(stage, depth);
        }

        match stage {
            TxStage::Work if !commit => {
                rollback("transaction scope dropped without commit".to_string());
                self.end(commit)
            }
            TxStage::Work if depth > 1 => {
                with_frame(|f| f.depth -= 1);
                Ok(())
            }
            TxStage::Work => {
                commit_outermost();
                Ok(())
            }
            TxStage::OnAbort if depth > 1 => {
                let reason = with_frame(|f| {
                    f.depth -= 1;
                    f.abort_reason.clone()
                });
                Err(Error::Aborted(
                    reason.unwrap_or_else(|| "transaction aborted".to_string()),
                ))
            }
            TxStage::OnAbort => Err(end_aborted_outermost()),
            other => Err(Error::Scope(format!(
                "transaction scope ended in stage {other}"
            ))),
        }
    }

    /// This scope ended while `depth` scopes are open and it is not the
    /// innermost one
    fn end_out_of_order(&self, stage: TxStage, depth: usize) -> Result<()> {
        if depth == 0 {
            return Err(Error::Scope(format!(
                "transaction scope at depth {} ended with no transaction open",
                self.depth
            )));
        }
        let message = format!(
            "transaction scope at depth {} ended while depth {depth} is open",
            self.depth
        );
        if stage == TxStage::Work {
            error!(
                pool = %self.pool.id(),
                depth = self.depth,
                open = depth,
                "transaction scopes ended out of order, aborting"
            );
            rollback(message.clone());
        }
        let remaining = with_frame(|f| {
            f.depth = f.depth.saturating_sub(1);
            f.depth
        });
        if remaining == 0 {
            return Err(end_aborted_outermost());
        }
        Err(Error::Scope(message))
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.done {
            self.done = true;
            // Aborts and out-of-order ends are logged where they happen
            let _ = self.end(false);
        }
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("pool", &self.pool.id())
            .field("depth", &self.depth)
            .field("stage", &stage())
            .finish()
    }
}

/// Run `f` inside a transaction on `pool`
///
/// Commits when `f` returns `Ok`. When `f` fails the transaction is rolled
/// back and `f`'s error is returned unchanged.
pub fn run<R, F>(pool: &PoolRef, f: F) -> Result<R>
where
    F: FnOnce(&mut Transaction) -> Result<R>,
{
    let mut tx = Transaction::begin(pool)?;
    match f(&mut tx) {
        Ok(value) => {
            tx.commit()?;
            Ok(value)
        }
        Err(e) => {
            tx.abort(e.to_string());
            drop(tx);
            Err(e)
        }
    }
}

/// Like [`run`], holding `locks` for the duration of the transaction
pub fn run_locked<R, F>(pool: &PoolRef, locks: &[&(dyn TxLock + 'static)], f: F) -> Result<R>
where
    F: FnOnce(&mut Transaction) -> Result<R>,
{
    let mut tx = Transaction::begin_locked(pool, locks)?;
    match f(&mut tx) {
        Ok(value) => {
            tx.commit()?;
            Ok(value)
        }
        Err(e) => {
            tx.abort(e.to_string());
            drop(tx);
            Err(e)
        }
    }
}
