#![forbid(unsafe_code)]

//! Transactional undo/redo engine.
//!
//! `retrace` lets a host application group a burst of state changes into
//! atomic, labeled, reversible transactions, coalesce consecutive compatible
//! transactions (merge), and replay them backward (undo) or forward (redo)
//! in strictly ordered fashion.
//!
//! # Key Components
//!
//! - [`Operation`] - Trait a host implements per reversible edit type
//! - [`Transaction`] - An atomic group of operations with a label and identity
//! - [`UndoManager`] - The orchestrator: begin/end, undo/redo, merge, eviction
//! - [`codec`] - Persist/restore of the full stack pair as a record stream
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        UndoManager                           │
//! │                                                              │
//! │  working: Option<Transaction>   (built between begin/end)    │
//! │                                                              │
//! │  ┌──────────────────┐          ┌──────────────────┐          │
//! │  │   Undo Stack     │          │   Redo Stack     │          │
//! │  │  ┌────────────┐  │  undo()  │  ┌────────────┐  │          │
//! │  │  │ TxN (top)  │  │ ──────►  │  │ Tx1        │  │          │
//! │  │  ├────────────┤  │          │  ├────────────┤  │          │
//! │  │  │ Tx2        │  │  ◄────── │  │ TxN (top)  │  │          │
//! │  │  ├────────────┤  │  redo()  │  └────────────┘  │          │
//! │  │  │ Tx1        │  │          │                  │          │
//! │  │  └────────────┘  │          │                  │          │
//! │  └──────────────────┘          └──────────────────┘          │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Transactions move *whole* between the two stacks: undo pops the undo top,
//! replays its operations in reverse insertion order, and pushes it onto the
//! redo stack; redo is the mirror image. A transaction lives in exactly one
//! of {working slot, undo stack, redo stack} at any time.
//!
//! # Quick Start
//!
//! ```ignore
//! use retrace::{MergeMode, UndoManager};
//!
//! let mut mgr = UndoManager::new();
//! mgr.begin(Some("+5"))?;
//! mgr.add_operation(Box::new(my_op), MergeMode::None)?;
//! mgr.end()?;
//!
//! assert!(mgr.can_undo());
//! mgr.undo(1)?;
//! assert!(mgr.can_redo());
//! ```
//!
//! # Concurrency Model
//!
//! Single-writer, cooperative, synchronous. Every mutating call takes
//! `&mut self`; no operation suspends or performs I/O. Hosts that expose a
//! manager to multiple callers wrap it in their own mutual exclusion.

pub mod codec;
pub mod manager;
pub mod op;
pub mod transaction;

pub use codec::{
    CodecError, OpRegistry, SavedOp, SavedRecord, SavedTransaction, SCHEMA_VERSION, restore,
    restore_jsonl, save, save_jsonl,
};
pub use manager::{HistoryError, UndoManager};
pub use op::{MergeMode, Operation};
pub use transaction::{CommitId, Transaction};
