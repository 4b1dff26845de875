#![forbid(unsafe_code)]

//! The [`Transaction`] container: an atomic group of operations.
//!
//! A transaction is created when [`UndoManager::begin`](crate::UndoManager::begin)
//! opens an update, filled with operations, and finalized by the matching
//! `end`. From then on it moves whole between the undo and redo stacks.
//!
//! # Invariants
//!
//! 1. Operation insertion order is the redo replay order; the reverse order
//!    is the undo replay order.
//! 2. `executed`, once set, is permanent: `set_can_merge(true)` refuses on
//!    an executed transaction.
//! 3. `commit()` invokes the commit callback only on operations added since
//!    the previous `commit()` call (the watermark); operations absorbed by a
//!    merge are already behind the watermark and never re-committed.
//!
//! Discarded, evicted, and replaced transactions are simply dropped; an
//! operation that holds resources releases them in its own `Drop` impl.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::op::Operation;

/// Identity of a finalized (or in-progress) transaction.
///
/// Monotonically assigned by the manager, starting at 1, wrapping back to 1
/// on overflow. Never 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommitId(pub(crate) u32);

impl CommitId {
    /// Raw numeric value.
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for CommitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An ordered group of operations that undoes and redoes as one unit.
pub struct Transaction {
    commit_id: CommitId,
    /// Insertion order = redo order; reversed for undo.
    ops: Vec<Box<dyn Operation>>,
    /// Watermark: ops below this index have had their `commit()` invoked.
    committed: usize,
    label: Option<String>,
    can_merge: bool,
    executed: bool,
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("commit_id", &self.commit_id)
            .field("ops", &self.ops.len())
            .field("label", &self.label)
            .field("can_merge", &self.can_merge)
            .field("executed", &self.executed)
            .finish()
    }
}

impl Transaction {
    pub(crate) fn new(commit_id: CommitId) -> Self {
        Self {
            commit_id,
            ops: Vec::new(),
            committed: 0,
            label: None,
            can_merge: true,
            executed: false,
        }
    }

    /// Rebuild a finalized transaction from persisted state. Restored
    /// operations are considered committed already.
    pub(crate) fn restored(
        commit_id: CommitId,
        label: Option<String>,
        can_merge: bool,
        executed: bool,
        ops: Vec<Box<dyn Operation>>,
    ) -> Self {
        let committed = ops.len();
        Self {
            commit_id,
            ops,
            committed,
            label,
            can_merge,
            executed,
        }
    }

    // ========================================================================
    // Identity and flags
    // ========================================================================

    /// The identity assigned when the transaction was opened.
    #[must_use]
    pub fn commit_id(&self) -> CommitId {
        self.commit_id
    }

    /// Whether a later update may merge into this transaction.
    #[must_use]
    pub fn can_merge(&self) -> bool {
        self.can_merge && !self.executed
    }

    /// Raw merge flag, without the executed gate. Codec use.
    pub(crate) fn can_merge_flag(&self) -> bool {
        self.can_merge
    }

    /// Whether this transaction has been involved in an undo pass.
    #[must_use]
    pub fn is_executed(&self) -> bool {
        self.executed
    }

    /// Enable or disable merging. Re-enabling fails (returns false) once
    /// the transaction has been executed; that flag is sticky.
    pub(crate) fn set_can_merge(&mut self, state: bool) -> bool {
        if state && self.executed {
            return false;
        }
        self.can_merge = state;
        true
    }

    /// Permanently seal this transaction against future merges.
    pub(crate) fn mark_executed(&mut self) {
        self.executed = true;
    }

    // ========================================================================
    // Label
    // ========================================================================

    /// User-visible label, if any.
    #[must_use]
    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    pub(crate) fn set_label(&mut self, label: Option<&str>) {
        self.label = label.map(str::to_owned);
    }

    /// Suggest a label. Despite the name this overwrites unconditionally,
    /// exactly like `set_label`; there is no "only if unset" behavior.
    pub(crate) fn suggest_label(&mut self, label: Option<&str>) {
        self.label = label.map(str::to_owned);
    }

    // ========================================================================
    // Operations
    // ========================================================================

    /// Append an operation. Ownership moves in; the same instance can never
    /// end up in two transactions.
    pub(crate) fn push_op(&mut self, op: Box<dyn Operation>) {
        self.ops.push(op);
    }

    /// Number of contained operations.
    #[must_use]
    pub fn op_count(&self) -> usize {
        self.ops.len()
    }

    /// True if the transaction contains any operation at all.
    #[must_use]
    pub fn has_operations(&self) -> bool {
        !self.ops.is_empty()
    }

    /// True iff any contained operation reports data.
    #[must_use]
    pub fn has_data(&self) -> bool {
        self.ops.iter().any(|op| op.has_data())
    }

    /// The most recently added operation.
    pub(crate) fn last_op_mut(&mut self) -> Option<&mut dyn Operation> {
        self.ops.last_mut().map(|op| op.as_mut() as &mut dyn Operation)
    }

    /// The most recently added operation, downcast to `T`. Only the top
    /// operation is inspected: merge candidates must be contiguous at the
    /// top, so a type mismatch there returns `None` rather than searching
    /// deeper (a deeper hit would reorder operations of the same type).
    pub(crate) fn last_op_as<T: Operation + 'static>(&mut self) -> Option<&mut T> {
        self.ops.last_mut()?.as_any_mut().downcast_mut::<T>()
    }

    /// Whether the top operation is a `T`.
    pub(crate) fn last_op_is<T: Operation + 'static>(&self) -> bool {
        self.ops
            .last()
            .is_some_and(|op| op.as_any().is::<T>())
    }

    /// Whether the top operation allows a later operation to merge in.
    pub(crate) fn last_allows_merge(&self) -> bool {
        self.ops.last().is_some_and(|op| op.allow_merge())
    }

    /// Iterate the contained operations in insertion order. Codec use.
    pub(crate) fn ops(&self) -> impl Iterator<Item = &dyn Operation> {
        self.ops.iter().map(|op| op.as_ref() as &dyn Operation)
    }

    pub(crate) fn has_uncommitted(&self) -> bool {
        self.committed < self.ops.len()
    }

    // ========================================================================
    // Replay
    // ========================================================================

    /// Invoke `commit()` on every operation added since the last commit,
    /// then advance the watermark.
    pub(crate) fn commit(&mut self) {
        if !self.has_uncommitted() {
            return;
        }
        for op in &mut self.ops[self.committed..] {
            op.commit();
        }
        self.committed = self.ops.len();
    }

    /// Replay all operations backward (reverse insertion order).
    pub(crate) fn undo(&mut self) {
        for op in self.ops.iter_mut().rev() {
            op.undo();
        }
    }

    /// Replay all operations forward (insertion order).
    pub(crate) fn redo(&mut self) {
        for op in &mut self.ops {
            op.redo();
        }
    }
}
