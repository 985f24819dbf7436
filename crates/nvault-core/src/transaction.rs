//! Transactions — all-or-nothing field writes across one or more blocks
//!
//! A `Transaction` accumulates pending field writes without taking any
//! lock. Commit acquires every touched block's update lock in lexicographic
//! name order (so overlapping transactions can never deadlock in a
//! circular wait), stages the writes into each block's shadow, then runs
//! two phases: prepare (durable medium writes, with undo logging) and
//! publish (flip the in-RAM committed state). A failure anywhere before
//! publish restores the medium and leaves nothing visible.
//!
//! `ScopedTransaction` layers join-or-create on top: collaborators receive
//! an explicit [`TransactionContext`] through the call chain, and every
//! scope opened on a context that already carries a transaction joins it.
//! Only the outermost scope's `complete()` actually commits.

use std::sync::Arc;

use crate::block::{BlockUpdate, PersistentBlock};
use crate::error::{NvError, NvResult};
use crate::events::{EventHub, StorageEvent};
use crate::value::FieldValue;

struct PendingWrite {
    block: Arc<PersistentBlock>,
    index: usize,
    field: String,
    value: FieldValue,
}

/// An ordered batch of pending field writes. Consumed by commit or
/// rollback, so a finished transaction cannot be reused.
pub struct Transaction {
    writes: Vec<PendingWrite>,
    events: Arc<EventHub>,
}

impl Transaction {
    pub(crate) fn new(events: Arc<EventHub>) -> Self {
        Self {
            writes: Vec::new(),
            events,
        }
    }

    /// Queue a field write. The field and index are validated now, fail-fast;
    /// the value becomes visible (and durable) only at commit.
    pub fn write(
        &mut self,
        block: &Arc<PersistentBlock>,
        index: usize,
        field: &str,
        value: FieldValue,
    ) -> NvResult<()> {
        if block.format().field(field).is_none() {
            return Err(NvError::FieldNotFound {
                format: block.format().name().to_string(),
                field: field.to_string(),
            });
        }
        if index >= block.count() {
            return Err(NvError::IndexOutOfRange {
                block: block.name().to_string(),
                index,
                count: block.count(),
            });
        }

        self.writes.push(PendingWrite {
            block: Arc::clone(block),
            index,
            field: field.to_string(),
            value,
        });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.writes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    /// Apply every pending write atomically. Raises the completion
    /// notification either way; on failure no block retains any of the
    /// transaction's bytes, in RAM or on the medium.
    pub fn commit(self) -> NvResult<()> {
        let result = Self::apply(&self.writes);
        self.events.emit(&StorageEvent::TransactionCompleted {
            committed: result.is_ok(),
        });
        result
    }

    /// Discard every pending write. Durable storage is untouched.
    pub fn rollback(self) {
        self.events
            .emit(&StorageEvent::TransactionCompleted { committed: false });
    }

    fn apply(writes: &[PendingWrite]) -> NvResult<()> {
        if writes.is_empty() {
            return Ok(());
        }

        // Group writes per block, preserving insertion order within each
        // group, then sort groups by block name: the deterministic lock
        // acquisition order
        let mut groups: Vec<(Arc<PersistentBlock>, Vec<usize>)> = Vec::new();
        for (i, write) in writes.iter().enumerate() {
            match groups.iter_mut().find(|(b, _)| b.name() == write.block.name()) {
                Some((_, indexes)) => indexes.push(i),
                None => groups.push((Arc::clone(&write.block), vec![i])),
            }
        }
        groups.sort_by(|a, b| a.0.name().cmp(b.0.name()));

        // Lock and stage. Any error here drops the guards, which rolls
        // every block back before anything reached the medium
        let mut updates: Vec<BlockUpdate<'_>> = Vec::with_capacity(groups.len());
        for (block, indexes) in &groups {
            let mut update = block.start_update(true)?;
            for &i in indexes {
                let write = &writes[i];
                update.set(write.index, &write.field, &write.value)?;
            }
            updates.push(update);
        }

        // Phase one: durable medium writes. On failure, restore every block
        // prepared so far and bail — committed state never changed
        for at in 0..updates.len() {
            if let Err(e) = updates[at].prepare() {
                for update in updates[..=at].iter_mut() {
                    update.undo_prepare();
                }
                return Err(e);
            }
        }

        // Phase two: infallible publish into committed RAM state
        for update in updates {
            update.publish();
        }
        Ok(())
    }
}

impl PersistentBlock {
    /// Start a transaction bound to this block's store. No lock is taken
    /// until commit, so writes can accumulate across several blocks first.
    pub fn transaction(self: &Arc<Self>) -> Transaction {
        Transaction::new(Arc::clone(self.events()))
    }
}

/// Carrier for the ambient transaction of one logical unit of work.
///
/// Created by the outermost operation and passed down the call chain
/// explicitly; nested collaborators that open a scope on it join the same
/// commit unit.
#[derive(Default)]
pub struct TransactionContext {
    current: Option<Transaction>,
}

impl TransactionContext {
    pub fn new() -> Self {
        Self { current: None }
    }

    /// True while a scope somewhere up the call chain holds a transaction.
    pub fn in_transaction(&self) -> bool {
        self.current.is_some()
    }
}

/// Join-or-create handle over a [`TransactionContext`].
///
/// The outermost scope creates the transaction and its `complete()`
/// commits; inner scopes share it and their `complete()` is a no-op.
/// Dropping the outermost scope without completing rolls everything back.
pub struct ScopedTransaction<'c> {
    ctx: &'c mut TransactionContext,
    outermost: bool,
    done: bool,
}

impl<'c> ScopedTransaction<'c> {
    pub(crate) fn enter(ctx: &'c mut TransactionContext, events: Arc<EventHub>) -> Self {
        let outermost = ctx.current.is_none();
        if outermost {
            ctx.current = Some(Transaction::new(events));
        }
        Self {
            ctx,
            outermost,
            done: false,
        }
    }

    /// Queue a field write on the shared transaction.
    pub fn write(
        &mut self,
        block: &Arc<PersistentBlock>,
        index: usize,
        field: &str,
        value: FieldValue,
    ) -> NvResult<()> {
        match self.ctx.current.as_mut() {
            Some(tx) => tx.write(block, index, field, value),
            // A live scope guarantees a transaction; this arm only exists
            // so a misuse fails loudly instead of silently dropping a write
            None => Err(NvError::InvalidSchema {
                format: String::new(),
                reason: "scoped write outside any transaction".to_string(),
            }),
        }
    }

    /// Reborrow the context for a nested collaborator, which will join this
    /// scope's transaction.
    pub fn context(&mut self) -> &mut TransactionContext {
        self.ctx
    }

    pub fn is_outermost(&self) -> bool {
        self.outermost
    }

    /// Finish the scope. Commits if (and only if) this is the outermost
    /// scope; inner completions just hand control back to their caller.
    pub fn complete(mut self) -> NvResult<()> {
        self.done = true;
        if !self.outermost {
            return Ok(());
        }
        match self.ctx.current.take() {
            Some(tx) => tx.commit(),
            None => Ok(()),
        }
    }
}

impl Drop for ScopedTransaction<'_> {
    fn drop(&mut self) {
        if self.outermost && !self.done {
            if let Some(tx) = self.ctx.current.take() {
                tx.rollback();
            }
        }
    }
}
