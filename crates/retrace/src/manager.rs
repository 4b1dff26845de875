#![forbid(unsafe_code)]

//! The [`UndoManager`] orchestrator.
//!
//! Owns the undo stack, the redo stack, and the working (in-progress)
//! transaction, and enforces every protocol invariant:
//!
//! 1. The two stacks are disjoint: a transaction moves between the working
//!    slot, the undo stack, and the redo stack; it is never duplicated.
//! 2. A working transaction exists iff the update nesting depth is > 0.
//! 3. `executed`, once set on a transaction, is permanent.
//! 4. `undo_stack.len() <= limit` whenever a history limit is set, enforced
//!    immediately after every push.
//! 5. Every transaction on either stack has at least one data-bearing
//!    operation; dataless transactions are dropped, never pushed.
//!
//! # Update protocol
//!
//! Updates nest: multiple [`begin`](UndoManager::begin) calls stack until
//! matched by the same number of [`end`](UndoManager::end) calls, and only
//! the final `end` finalizes. Each `begin` overwrites the working label, so
//! in a nested sequence the *last* label wins: the innermost caller sits
//! closest to the edit and names it.
//!
//! # Merging
//!
//! With [`MergeMode::Any`], the first add into a fresh update may retarget
//! the working transaction onto the most recent undo-stack entry, provided
//! that entry is still mergeable. The entry is popped off the stack and the
//! update continues building into it; finalizing pushes it back, so the
//! stack gains no net entry.

use std::collections::VecDeque;
use std::fmt;

use crate::op::{MergeMode, Operation};
use crate::transaction::{CommitId, Transaction};

/// Default cap on retained undo transactions.
const DEFAULT_HISTORY_LIMIT: usize = 20;

/// Contract violation by the host: an operation was invoked outside its
/// required phase. Never a recoverable runtime condition; surfaced to the
/// caller immediately so internal invariants stay intact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryError {
    /// `begin`, `undo`, or `redo` was called while a replay is executing.
    ReplayInProgress,
    /// The call requires an open transaction and none is open.
    NoOpenTransaction,
    /// The call is forbidden while a transaction is open
    /// (`undo`, `redo`, serialize, restore).
    TransactionOpen,
}

impl fmt::Display for HistoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReplayInProgress => write!(f, "can't be called while performing undo/redo"),
            Self::NoOpenTransaction => write!(f, "must be called during an open transaction"),
            Self::TransactionOpen => write!(f, "can't be called while a transaction is open"),
        }
    }
}

impl std::error::Error for HistoryError {}

/// Orchestrator for transactional undo/redo.
///
/// See the [module docs](self) for the protocol and invariants.
pub struct UndoManager {
    /// Finalized transactions available for undo (top = back).
    undo_stack: VecDeque<Transaction>,
    /// Undone transactions available for redo (top = back).
    redo_stack: VecDeque<Transaction>,
    /// The in-progress transaction, present iff `depth > 0`.
    working: Option<Transaction>,
    /// Update nesting depth.
    depth: usize,
    /// Maximum retained undo transactions; `None` = unlimited.
    history_limit: Option<usize>,
    /// Next commit id to assign. Starts at 1, wraps to 1, never 0.
    next_id: u32,
    /// True only while an undo/redo replay is executing.
    in_replay: bool,
    /// True once the working transaction absorbed an undo-stack entry
    /// during the current update scope.
    merged: bool,
}

impl fmt::Debug for UndoManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UndoManager")
            .field("undo_depth", &self.undo_stack.len())
            .field("redo_depth", &self.redo_stack.len())
            .field("nesting", &self.depth)
            .field("history_limit", &self.history_limit)
            .field("in_replay", &self.in_replay)
            .finish()
    }
}

impl Default for UndoManager {
    fn default() -> Self {
        Self::new()
    }
}

impl UndoManager {
    /// Create a manager with the default history limit (20).
    #[must_use]
    pub fn new() -> Self {
        Self::with_history_limit(Some(DEFAULT_HISTORY_LIMIT))
    }

    /// Create a manager with an explicit history limit; `None` = unlimited.
    #[must_use]
    pub fn with_history_limit(limit: Option<usize>) -> Self {
        Self {
            undo_stack: VecDeque::new(),
            redo_stack: VecDeque::new(),
            working: None,
            depth: 0,
            history_limit: limit,
            next_id: 1,
            in_replay: false,
            merged: false,
        }
    }

    fn alloc_id(&mut self) -> CommitId {
        let id = CommitId(self.next_id);
        self.next_id = self.next_id.checked_add(1).unwrap_or(1);
        id
    }

    // ========================================================================
    // Update lifecycle
    // ========================================================================

    /// Open (or nest into) a transaction.
    ///
    /// The label overwrites the working transaction's label unconditionally,
    /// so in `begin(A); begin(B); ... end; end` the persisted label is `B`.
    pub fn begin(&mut self, label: Option<&str>) -> Result<(), HistoryError> {
        if self.in_replay {
            return Err(HistoryError::ReplayInProgress);
        }
        if self.depth == 0 {
            let id = self.alloc_id();
            tracing::trace!(commit_id = %id, "transaction opened");
            self.working = Some(Transaction::new(id));
            self.merged = false;
        }
        if let Some(working) = self.working.as_mut() {
            working.suggest_label(label);
        }
        self.depth += 1;
        Ok(())
    }

    /// Close one nesting level; the outermost close finalizes.
    ///
    /// Finalizing commits the newly added operations, clears the redo stack
    /// (a fresh edit invalidates prior redo history), permanently seals the
    /// previous undo top against merging, pushes the transaction, and then
    /// evicts from the oldest end while over the history limit. A dataless
    /// transaction is dropped instead of pushed.
    pub fn end(&mut self) -> Result<(), HistoryError> {
        if self.depth == 0 || self.working.is_none() {
            return Err(HistoryError::NoOpenTransaction);
        }
        self.depth -= 1;
        if self.depth == 0 {
            if let Some(tx) = self.working.take() {
                self.push_finalized(tx);
            }
        }
        Ok(())
    }

    /// Shared finalize path for `end` and `commit_finalized`.
    fn push_finalized(&mut self, mut tx: Transaction) {
        if tx.has_data() {
            tx.commit();
            self.redo_stack.clear();
            if let Some(prev) = self.undo_stack.back_mut() {
                // The entry below the new top can never be merged again; the
                // only way back to it is an undo.
                prev.mark_executed();
            }
            tracing::debug!(
                commit_id = %tx.commit_id(),
                ops = tx.op_count(),
                label = tx.label().unwrap_or(""),
                "transaction pushed"
            );
            self.undo_stack.push_back(tx);
            self.enforce_limit();
        } else {
            tracing::trace!(commit_id = %tx.commit_id(), "dataless transaction discarded");
        }
    }

    fn enforce_limit(&mut self) {
        let Some(limit) = self.history_limit else {
            return;
        };
        while self.undo_stack.len() > limit {
            if let Some(old) = self.undo_stack.pop_front() {
                tracing::debug!(commit_id = %old.commit_id(), "history entry evicted");
            }
        }
    }

    // ========================================================================
    // Building the working transaction
    // ========================================================================

    /// Append an operation to the working transaction.
    ///
    /// Only [`MergeMode::Any`] may retarget the working transaction onto an
    /// existing mergeable undo-stack top; that entry is popped and the update
    /// continues building into it. [`MergeMode::Unique`] is accepted but
    /// performs no merge. At most one merge happens per update scope.
    pub fn add_operation(
        &mut self,
        op: Box<dyn Operation>,
        mode: MergeMode,
    ) -> Result<(), HistoryError> {
        if self.working.is_none() {
            return Err(HistoryError::NoOpenTransaction);
        }
        if mode == MergeMode::Any {
            self.try_retarget(|top| top.last_allows_merge());
        }
        if let Some(working) = self.working.as_mut() {
            working.push_op(op);
        }
        Ok(())
    }

    /// The most recent operation of the working transaction, with the same
    /// merge gating as [`add_operation`](Self::add_operation). Callers use
    /// this to grow an existing operation's payload instead of adding a new
    /// one.
    pub fn last_operation(
        &mut self,
        mode: MergeMode,
    ) -> Result<Option<&mut dyn Operation>, HistoryError> {
        if self.working.is_none() {
            return Err(HistoryError::NoOpenTransaction);
        }
        if mode == MergeMode::Any {
            self.try_retarget(|top| top.last_allows_merge());
        }
        Ok(self.working.as_mut().and_then(Transaction::last_op_mut))
    }

    /// Like [`last_operation`](Self::last_operation) but filtered to the
    /// concrete type `T`. Only the top operation is considered; a type
    /// mismatch there yields `None` without searching deeper.
    pub fn last_operation_as<T: Operation + 'static>(
        &mut self,
        mode: MergeMode,
    ) -> Result<Option<&mut T>, HistoryError> {
        if self.working.is_none() {
            return Err(HistoryError::NoOpenTransaction);
        }
        if mode == MergeMode::Any {
            self.try_retarget(|top| top.last_op_is::<T>() && top.last_allows_merge());
        }
        Ok(self.working.as_mut().and_then(Transaction::last_op_as::<T>))
    }

    /// Pop the undo top into the working slot when the merge gate passes:
    /// not merged yet this scope, working has no data, and the top is
    /// mergeable with at least one operation satisfying `extra_gate`.
    fn try_retarget(&mut self, extra_gate: impl Fn(&Transaction) -> bool) {
        if self.merged {
            return;
        }
        let working_empty = self
            .working
            .as_ref()
            .is_some_and(|working| !working.has_data());
        if !working_empty {
            return;
        }
        let eligible = self
            .undo_stack
            .back()
            .is_some_and(|top| top.can_merge() && top.has_operations() && extra_gate(top));
        if !eligible {
            return;
        }
        if let Some(top) = self.undo_stack.pop_back() {
            tracing::debug!(commit_id = %top.commit_id(), "merging update into previous transaction");
            // The fresh working transaction (label included) is discarded in
            // favor of the absorbed entry.
            self.working = Some(top);
            self.merged = true;
        }
    }

    /// Overwrite the working transaction's label.
    pub fn set_label(&mut self, label: Option<&str>) -> Result<(), HistoryError> {
        match self.working.as_mut() {
            Some(working) => {
                working.set_label(label);
                Ok(())
            }
            None => Err(HistoryError::NoOpenTransaction),
        }
    }

    /// Suggest a label for the working transaction. Overwrites
    /// unconditionally, exactly like [`set_label`](Self::set_label).
    pub fn suggest_label(&mut self, label: Option<&str>) -> Result<(), HistoryError> {
        match self.working.as_mut() {
            Some(working) => {
                working.suggest_label(label);
                Ok(())
            }
            None => Err(HistoryError::NoOpenTransaction),
        }
    }

    /// Whether the working transaction contains any operation.
    pub fn has_operation(&self) -> Result<bool, HistoryError> {
        match self.working.as_ref() {
            Some(working) => Ok(working.has_operations()),
            None => Err(HistoryError::NoOpenTransaction),
        }
    }

    // ========================================================================
    // Commit / uncommit
    // ========================================================================

    /// Seal the last finalized transaction against further merging.
    ///
    /// Inside an open transaction that has data, this pushes the working
    /// transaction early (sealed), opens a fresh replacement with a new id,
    /// and returns the old id; the update nesting is unaffected. With no
    /// transaction open, it seals the undo-stack top and returns its id.
    /// Returns `None` when neither applies.
    pub fn commit_finalized(&mut self) -> Option<CommitId> {
        match self.working.take() {
            Some(mut tx) if tx.has_data() && tx.has_operations() => {
                tx.set_can_merge(false);
                let id = tx.commit_id();
                self.push_finalized(tx);
                let fresh = Transaction::new(self.alloc_id());
                self.working = Some(fresh);
                self.merged = true;
                Some(id)
            }
            Some(tx) => {
                // Open but dataless: nothing to seal.
                self.working = Some(tx);
                None
            }
            None => {
                let top = self.undo_stack.back_mut()?;
                top.set_can_merge(false);
                Some(top.commit_id())
            }
        }
    }

    /// Attempt to reopen a previously sealed transaction for merging.
    ///
    /// Succeeds only if the working transaction or the undo-stack top has
    /// exactly this id, has at least one operation, and has not been
    /// executed. Refusal is an expected outcome, hence `bool` not `Err`.
    pub fn reopen_for_merge(&mut self, id: CommitId) -> bool {
        match self.working.as_mut() {
            Some(working) if working.commit_id() == id => {
                working.has_operations() && working.set_can_merge(true)
            }
            _ => match self.undo_stack.back_mut() {
                Some(top) if top.commit_id() == id && top.has_operations() => {
                    top.set_can_merge(true)
                }
                _ => false,
            },
        }
    }

    // ========================================================================
    // Replay
    // ========================================================================

    /// Undo up to `count` transactions, moving each from the undo stack to
    /// the redo stack. Returns how many were actually undone.
    ///
    /// Seals the current undo top as executed *before* popping anything, so
    /// even `undo(0)` closes the door on merging into it.
    pub fn undo(&mut self, count: usize) -> Result<usize, HistoryError> {
        if self.working.is_some() {
            return Err(HistoryError::TransactionOpen);
        }
        if self.in_replay {
            return Err(HistoryError::ReplayInProgress);
        }
        self.in_replay = true;
        if let Some(top) = self.undo_stack.back_mut() {
            top.mark_executed();
        }
        let mut done = 0;
        while done < count {
            let Some(mut tx) = self.undo_stack.pop_back() else {
                break;
            };
            tracing::debug!(commit_id = %tx.commit_id(), "undoing transaction");
            tx.undo();
            self.redo_stack.push_back(tx);
            done += 1;
        }
        self.in_replay = false;
        Ok(done)
    }

    /// Redo up to `count` transactions, moving each from the redo stack back
    /// to the undo stack. Returns how many were actually redone.
    ///
    /// Unlike [`undo`](Self::undo), redo applies no executed-sealing side
    /// effect; the asymmetry is part of the protocol.
    pub fn redo(&mut self, count: usize) -> Result<usize, HistoryError> {
        if self.working.is_some() {
            return Err(HistoryError::TransactionOpen);
        }
        if self.in_replay {
            return Err(HistoryError::ReplayInProgress);
        }
        self.in_replay = true;
        let mut done = 0;
        while done < count {
            let Some(mut tx) = self.redo_stack.pop_back() else {
                break;
            };
            tracing::debug!(commit_id = %tx.commit_id(), "redoing transaction");
            tx.redo();
            self.undo_stack.push_back(tx);
            done += 1;
        }
        self.in_replay = false;
        // The limit may have shrunk while these entries sat on the redo
        // stack; the bound holds after every push.
        self.enforce_limit();
        Ok(done)
    }

    // ========================================================================
    // Maintenance
    // ========================================================================

    /// Drop up to `count` transactions from the *oldest* end of the undo
    /// stack. Returns how many were dropped.
    pub fn forget_undo(&mut self, count: usize) -> usize {
        let n = count.min(self.undo_stack.len());
        for _ in 0..n {
            self.undo_stack.pop_front();
        }
        n
    }

    /// Drop up to `count` transactions from the *oldest* end of the redo
    /// stack. Returns how many were dropped.
    pub fn forget_redo(&mut self, count: usize) -> usize {
        let n = count.min(self.redo_stack.len());
        for _ in 0..n {
            self.redo_stack.pop_front();
        }
        n
    }

    /// Drop all history on both stacks.
    pub fn clear(&mut self) {
        self.undo_stack.clear();
        self.redo_stack.clear();
    }

    /// Current history limit; `None` = unlimited.
    #[must_use]
    pub fn history_limit(&self) -> Option<usize> {
        self.history_limit
    }

    /// Change the history limit. Shrinking evicts immediately from the
    /// oldest end of the undo stack.
    pub fn set_history_limit(&mut self, limit: Option<usize>) {
        self.history_limit = limit;
        self.enforce_limit();
    }

    // ========================================================================
    // Query
    // ========================================================================

    /// True if at least one transaction can be undone.
    #[must_use]
    pub fn can_undo(&self) -> bool {
        !self.undo_stack.is_empty()
    }

    /// True if at least one transaction can be redone.
    #[must_use]
    pub fn can_redo(&self) -> bool {
        !self.redo_stack.is_empty()
    }

    /// Number of transactions on the undo stack.
    #[must_use]
    pub fn count_undo(&self) -> usize {
        self.undo_stack.len()
    }

    /// Number of transactions on the redo stack.
    #[must_use]
    pub fn count_redo(&self) -> usize {
        self.redo_stack.len()
    }

    /// Label of the transaction the next undo would revert.
    #[must_use]
    pub fn undo_label(&self) -> Option<&str> {
        self.undo_stack.back().and_then(Transaction::label)
    }

    /// Label of the transaction the next redo would re-apply.
    #[must_use]
    pub fn redo_label(&self) -> Option<&str> {
        self.redo_stack.back().and_then(Transaction::label)
    }

    /// Current update nesting depth.
    #[must_use]
    pub fn nesting_depth(&self) -> usize {
        self.depth
    }

    /// True while inside a `begin`/`end` pair.
    #[must_use]
    pub fn is_in_update(&self) -> bool {
        self.depth > 0
    }

    /// True only while an undo/redo replay is executing. Host operations
    /// check this to avoid generating new transactions while being replayed.
    #[must_use]
    pub fn is_replaying(&self) -> bool {
        self.in_replay
    }

    // ========================================================================
    // Codec access
    // ========================================================================

    pub(crate) fn undo_entries(&self) -> impl DoubleEndedIterator<Item = &Transaction> {
        self.undo_stack.iter()
    }

    pub(crate) fn redo_entries(&self) -> impl DoubleEndedIterator<Item = &Transaction> {
        self.redo_stack.iter()
    }

    /// Replace the whole persisted state. Existing stack contents are
    /// dropped. The commit-id counter is deliberately not restored; fresh
    /// ids continue from this manager's own sequence.
    pub(crate) fn replace_state(
        &mut self,
        limit: Option<usize>,
        undo: VecDeque<Transaction>,
        redo: VecDeque<Transaction>,
    ) {
        self.undo_stack = undo;
        self.redo_stack = redo;
        self.history_limit = limit;
        tracing::debug!(
            undo = self.undo_stack.len(),
            redo = self.redo_stack.len(),
            "history restored"
        );
    }
}
