#![forbid(unsafe_code)]

//! The [`Operation`] capability contract and merge modes.
//!
//! An operation is the smallest unit of reversible change. Hosts implement
//! [`Operation`] once per concrete edit type and hand boxed instances to
//! [`UndoManager::add_operation`](crate::UndoManager::add_operation); the
//! engine owns them from that point on and drives the `commit`/`undo`/`redo`
//! callbacks at the right times.
//!
//! # Contract
//!
//! - `commit()` runs exactly once, when the containing transaction is
//!   finalized. Operations absorbed from a merge are never re-committed.
//! - `undo()` reverses the edit; `redo()` re-applies it after an undo.
//! - Callbacks are infallible. If a host callback cannot complete, that is
//!   outside the engine's error model and must be handled before returning.
//! - An operation is owned by exactly one transaction; it moves in by value
//!   and is never shared or mutated concurrently.

use std::any::Any;
use std::fmt;

/// Merge behavior requested when adding or fetching an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MergeMode {
    /// Never merge with the last finalized transaction.
    #[default]
    None,
    /// Reserved for merge-once semantics; currently performs no merge and
    /// behaves exactly like [`MergeMode::None`].
    Unique,
    /// Merge with the last finalized transaction when it is still mergeable.
    Any,
}

/// A single reversible edit.
///
/// Concrete edit types (arithmetic deltas, text edits, ...) are independent
/// implementers; the engine never knows their payloads. Each operation is
/// self-serializing for the [`codec`](crate::codec): `kind()` names the
/// variant and `encode()` produces an opaque payload that a host-registered
/// decoder turns back into a live operation on restore.
pub trait Operation: Send + Sync {
    /// Apply the edit when the containing transaction is finalized.
    /// Invoked exactly once, never again.
    fn commit(&mut self);

    /// Reverse the edit.
    fn undo(&mut self);

    /// Re-apply the edit after an undo.
    fn redo(&mut self);

    /// Whether this operation actually contains modification data.
    /// Returning false drops the operation's transaction if nothing else
    /// in it has data.
    fn has_data(&self) -> bool {
        true
    }

    /// Whether a later operation may merge into this one's transaction.
    fn allow_merge(&self) -> bool {
        true
    }

    /// Type discriminator used by the codec and its decoder registry.
    fn kind(&self) -> &'static str;

    /// Self-describing serialized payload, opaque to the engine.
    fn encode(&self) -> serde_json::Value;

    /// Downcast to the concrete type for typed last-operation lookup.
    fn as_any(&self) -> &dyn Any;

    /// Downcast to the mutable concrete type.
    fn as_any_mut(&mut self) -> &mut dyn Any;

    /// Short name for Debug output.
    fn debug_name(&self) -> &'static str {
        "Operation"
    }
}

impl fmt::Debug for dyn Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(self.debug_name())
            .field("kind", &self.kind())
            .field("has_data", &self.has_data())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopOp;

    impl Operation for NoopOp {
        fn commit(&mut self) {}
        fn undo(&mut self) {}
        fn redo(&mut self) {}
        fn kind(&self) -> &'static str {
            "noop"
        }
        fn encode(&self) -> serde_json::Value {
            serde_json::Value::Null
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    #[test]
    fn defaults_report_data_and_mergeable() {
        let op = NoopOp;
        assert!(op.has_data());
        assert!(op.allow_merge());
    }

    #[test]
    fn merge_mode_default_is_none() {
        assert_eq!(MergeMode::default(), MergeMode::None);
    }

    #[test]
    fn trait_object_debug_includes_kind() {
        let op: Box<dyn Operation> = Box::new(NoopOp);
        let s = format!("{op:?}");
        assert!(s.contains("noop"));
    }
}
