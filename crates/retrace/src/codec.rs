#![forbid(unsafe_code)]

//! History persistence.
//!
//! The history serializes to a flat stream of tagged records: a header,
//! the undo stack top-to-bottom, a marker carrying the redo count, the redo
//! stack top-to-bottom, and an end sentinel. The sentinel distinguishes a
//! complete stream from a truncated one.
//!
//! Operations are trait objects, so decoding needs help from the host: an
//! [`OpRegistry`] maps each operation `kind` string back to a constructor
//! that rebuilds the concrete type from its JSON payload. Records whose
//! kind has no registered decoder fail the restore; dropping state silently
//! would leave the stacks inconsistent with what the host believes it saved.
//!
//! On-disk framing is JSON Lines, one record per line.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::io::{self, BufRead, Write};

use serde::{Deserialize, Serialize};

use crate::manager::{HistoryError, UndoManager};
use crate::op::Operation;
use crate::transaction::{CommitId, Transaction};

/// Bumped whenever the record layout changes incompatibly.
pub const SCHEMA_VERSION: &str = "retrace-history-v1";

// ============================================================================
// Records
// ============================================================================

/// One serialized operation: its registry kind plus an opaque payload the
/// concrete type produced via [`Operation::encode`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SavedOp {
    pub kind: String,
    pub payload: serde_json::Value,
}

/// One serialized transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SavedTransaction {
    pub commit_id: CommitId,
    pub can_merge: bool,
    pub executed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub ops: Vec<SavedOp>,
}

/// A single record in the history stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum SavedRecord {
    /// Always first. Names the schema and the history limit in effect.
    Header {
        schema_version: String,
        history_limit: Option<usize>,
    },
    /// One undo-stack entry, emitted top to bottom.
    UndoState(SavedTransaction),
    /// Separates the undo section from the redo section and asserts how
    /// many redo entries follow.
    RedoMarker { count: usize },
    /// One redo-stack entry, emitted top to bottom.
    RedoState(SavedTransaction),
    /// Always last. Its absence means the stream was cut short.
    End,
}

// ============================================================================
// Errors
// ============================================================================

/// Failure while saving or restoring history.
#[derive(Debug)]
pub enum CodecError {
    /// Save or restore attempted while a transaction is open.
    State(HistoryError),
    Io(io::Error),
    Json(serde_json::Error),
    /// The stream's schema version doesn't match [`SCHEMA_VERSION`].
    SchemaVersion(String),
    /// The stream contains an operation kind no decoder is registered for.
    UnknownOpKind(String),
    /// The end sentinel never arrived.
    Truncated,
    /// The record stream violates the expected layout.
    BadRecord(String),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::State(e) => write!(f, "history state error: {e}"),
            Self::Io(e) => write!(f, "i/o error: {e}"),
            Self::Json(e) => write!(f, "json error: {e}"),
            Self::SchemaVersion(got) => {
                write!(f, "schema version mismatch: got {got:?}, want {SCHEMA_VERSION:?}")
            }
            Self::UnknownOpKind(kind) => write!(f, "no decoder registered for op kind {kind:?}"),
            Self::Truncated => write!(f, "history stream ended without an end record"),
            Self::BadRecord(msg) => write!(f, "malformed history stream: {msg}"),
        }
    }
}

impl std::error::Error for CodecError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::State(e) => Some(e),
            Self::Io(e) => Some(e),
            Self::Json(e) => Some(e),
            _ => None,
        }
    }
}

impl From<HistoryError> for CodecError {
    fn from(e: HistoryError) -> Self {
        Self::State(e)
    }
}

impl From<io::Error> for CodecError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<serde_json::Error> for CodecError {
    fn from(e: serde_json::Error) -> Self {
        Self::Json(e)
    }
}

// ============================================================================
// Decoder registry
// ============================================================================

type OpDecoder = Box<dyn Fn(&serde_json::Value) -> Result<Box<dyn Operation>, CodecError> + Send + Sync>;

/// Maps operation `kind` strings to payload decoders.
///
/// Hosts register one decoder per concrete operation type before calling
/// [`restore`](UndoManager) helpers.
#[derive(Default)]
pub struct OpRegistry {
    decoders: HashMap<String, OpDecoder>,
}

impl fmt::Debug for OpRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<&str> = self.decoders.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        f.debug_struct("OpRegistry").field("kinds", &kinds).finish()
    }
}

impl OpRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a decoder for `kind`. A later registration for the same
    /// kind replaces the earlier one.
    pub fn register<F>(&mut self, kind: &str, decode: F)
    where
        F: Fn(&serde_json::Value) -> Result<Box<dyn Operation>, CodecError> + Send + Sync + 'static,
    {
        self.decoders.insert(kind.to_owned(), Box::new(decode));
    }

    fn decode(&self, op: &SavedOp) -> Result<Box<dyn Operation>, CodecError> {
        match self.decoders.get(&op.kind) {
            Some(decode) => decode(&op.payload),
            None => Err(CodecError::UnknownOpKind(op.kind.clone())),
        }
    }
}

// ============================================================================
// Save
// ============================================================================

fn save_transaction(tx: &Transaction) -> SavedTransaction {
    SavedTransaction {
        commit_id: tx.commit_id(),
        can_merge: tx.can_merge_flag(),
        executed: tx.is_executed(),
        label: tx.label().map(str::to_owned),
        ops: tx
            .ops()
            .map(|op| SavedOp {
                kind: op.kind().to_owned(),
                payload: op.encode(),
            })
            .collect(),
    }
}

/// Serialize the full history to a record stream.
///
/// Fails with [`CodecError::State`] while a transaction is open; the
/// working transaction has no stable serialized form.
pub fn save(mgr: &UndoManager) -> Result<Vec<SavedRecord>, CodecError> {
    if mgr.is_in_update() {
        return Err(HistoryError::TransactionOpen.into());
    }
    let mut records = Vec::with_capacity(mgr.count_undo() + mgr.count_redo() + 3);
    records.push(SavedRecord::Header {
        schema_version: SCHEMA_VERSION.to_owned(),
        history_limit: mgr.history_limit(),
    });
    for tx in mgr.undo_entries().rev() {
        records.push(SavedRecord::UndoState(save_transaction(tx)));
    }
    records.push(SavedRecord::RedoMarker {
        count: mgr.count_redo(),
    });
    for tx in mgr.redo_entries().rev() {
        records.push(SavedRecord::RedoState(save_transaction(tx)));
    }
    records.push(SavedRecord::End);
    tracing::debug!(records = records.len(), "history saved");
    Ok(records)
}

// ============================================================================
// Restore
// ============================================================================

fn restore_transaction(
    saved: &SavedTransaction,
    registry: &OpRegistry,
) -> Result<Transaction, CodecError> {
    let mut ops = Vec::with_capacity(saved.ops.len());
    for op in &saved.ops {
        ops.push(registry.decode(op)?);
    }
    let tx = Transaction::restored(
        saved.commit_id,
        saved.label.clone(),
        saved.can_merge,
        saved.executed,
        ops,
    );
    // Stack entries always carry data; a dataless record never came from
    // `save`.
    if !tx.has_data() {
        return Err(CodecError::BadRecord(format!(
            "transaction {} has no data-bearing operation",
            saved.commit_id
        )));
    }
    Ok(tx)
}

/// Rebuild the history from a record stream, replacing whatever the
/// manager currently holds.
///
/// The stream must start with a matching header, carry a redo marker whose
/// count matches the redo records, and close with the end sentinel. Any
/// failure leaves the manager's existing state untouched.
pub fn restore(
    mgr: &mut UndoManager,
    records: &[SavedRecord],
    registry: &OpRegistry,
) -> Result<(), CodecError> {
    if mgr.is_in_update() {
        return Err(HistoryError::TransactionOpen.into());
    }

    let mut iter = records.iter();
    let limit = match iter.next() {
        Some(SavedRecord::Header {
            schema_version,
            history_limit,
        }) => {
            if schema_version != SCHEMA_VERSION {
                return Err(CodecError::SchemaVersion(schema_version.clone()));
            }
            *history_limit
        }
        Some(other) => {
            return Err(CodecError::BadRecord(format!(
                "expected header, got {other:?}"
            )));
        }
        None => return Err(CodecError::Truncated),
    };

    // Records arrive top-to-bottom; collect then reverse so push order
    // rebuilds each stack bottom-up.
    let mut undo_top_down: Vec<Transaction> = Vec::new();
    let mut redo_top_down: Vec<Transaction> = Vec::new();
    let mut redo_count: Option<usize> = None;
    let mut sealed = false;

    for record in iter {
        if sealed {
            return Err(CodecError::BadRecord("records after end sentinel".into()));
        }
        match record {
            SavedRecord::UndoState(saved) => {
                if redo_count.is_some() {
                    return Err(CodecError::BadRecord(
                        "undo record after redo marker".into(),
                    ));
                }
                undo_top_down.push(restore_transaction(saved, registry)?);
            }
            SavedRecord::RedoMarker { count } => {
                if redo_count.is_some() {
                    return Err(CodecError::BadRecord("duplicate redo marker".into()));
                }
                redo_count = Some(*count);
            }
            SavedRecord::RedoState(saved) => {
                if redo_count.is_none() {
                    return Err(CodecError::BadRecord(
                        "redo record before redo marker".into(),
                    ));
                }
                redo_top_down.push(restore_transaction(saved, registry)?);
            }
            SavedRecord::End => sealed = true,
            SavedRecord::Header { .. } => {
                return Err(CodecError::BadRecord("duplicate header".into()));
            }
        }
    }

    if !sealed {
        return Err(CodecError::Truncated);
    }
    match redo_count {
        Some(count) if count != redo_top_down.len() => {
            return Err(CodecError::BadRecord(format!(
                "redo marker says {count}, stream has {}",
                redo_top_down.len()
            )));
        }
        None => return Err(CodecError::BadRecord("missing redo marker".into())),
        _ => {}
    }

    let undo: VecDeque<Transaction> = undo_top_down.into_iter().rev().collect();
    let redo: VecDeque<Transaction> = redo_top_down.into_iter().rev().collect();
    mgr.replace_state(limit, undo, redo);
    Ok(())
}

// ============================================================================
// JSONL framing
// ============================================================================

/// Serialize the history as JSON Lines to `out`.
pub fn save_jsonl<W: Write>(mgr: &UndoManager, mut out: W) -> Result<(), CodecError> {
    for record in save(mgr)? {
        serde_json::to_writer(&mut out, &record)?;
        out.write_all(b"\n")?;
    }
    out.flush()?;
    Ok(())
}

/// Restore the history from JSON Lines on `input`. Blank lines are skipped.
pub fn restore_jsonl<R: BufRead>(
    mgr: &mut UndoManager,
    input: R,
    registry: &OpRegistry,
) -> Result<(), CodecError> {
    let mut records = Vec::new();
    for line in input.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        records.push(serde_json::from_str::<SavedRecord>(&line)?);
    }
    restore(mgr, &records, registry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::op::MergeMode;
    use std::any::Any;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct StampOp {
        value: i64,
    }

    impl Operation for StampOp {
        fn commit(&mut self) {}
        fn undo(&mut self) {}
        fn redo(&mut self) {}
        fn kind(&self) -> &'static str {
            "stamp"
        }
        fn encode(&self) -> serde_json::Value {
            serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    fn registry() -> OpRegistry {
        let mut reg = OpRegistry::new();
        reg.register("stamp", |payload| {
            let op: StampOp = serde_json::from_value(payload.clone())?;
            Ok(Box::new(op))
        });
        reg
    }

    fn populated_manager() -> UndoManager {
        let mut mgr = UndoManager::new();
        for (label, value) in [("+1", 1), ("+2", 2), ("+3", 3)] {
            mgr.begin(Some(label)).unwrap();
            mgr.add_operation(Box::new(StampOp { value }), MergeMode::None)
                .unwrap();
            mgr.end().unwrap();
        }
        mgr.undo(1).unwrap();
        mgr
    }

    #[test]
    fn record_stream_layout() {
        let mgr = populated_manager();
        let records = save(&mgr).unwrap();
        assert_eq!(records.len(), 6);
        assert!(matches!(records[0], SavedRecord::Header { .. }));
        // Undo top first: "+2" is the top after one undo.
        match &records[1] {
            SavedRecord::UndoState(tx) => assert_eq!(tx.label.as_deref(), Some("+2")),
            other => panic!("expected undo record, got {other:?}"),
        }
        assert!(matches!(records[3], SavedRecord::RedoMarker { count: 1 }));
        assert!(matches!(records[5], SavedRecord::End));
    }

    #[test]
    fn round_trip_preserves_stacks_and_flags() {
        let mgr = populated_manager();
        let records = save(&mgr).unwrap();

        let mut restored = UndoManager::new();
        restore(&mut restored, &records, &registry()).unwrap();
        assert_eq!(restored.count_undo(), 2);
        assert_eq!(restored.count_redo(), 1);
        assert_eq!(restored.undo_label(), Some("+2"));
        assert_eq!(restored.redo_label(), Some("+3"));
        assert_eq!(restored.history_limit(), mgr.history_limit());

        // Replay still works on restored entries.
        assert_eq!(restored.redo(1).unwrap(), 1);
        assert_eq!(restored.undo_label(), Some("+3"));
    }

    #[test]
    fn executed_flag_survives_a_round_trip() {
        let mut mgr = populated_manager();
        // "+2" is now the top; sealing via undo(0) marks it executed.
        mgr.undo(0).unwrap();
        let records = save(&mgr).unwrap();

        let mut restored = UndoManager::new();
        restore(&mut restored, &records, &registry()).unwrap();
        restored.begin(Some("merge attempt")).unwrap();
        restored
            .add_operation(Box::new(StampOp { value: 9 }), MergeMode::Any)
            .unwrap();
        restored.end().unwrap();
        assert_eq!(restored.count_undo(), 3, "executed top must not merge");
    }

    #[test]
    fn save_during_update_is_invalid_state() {
        let mut mgr = UndoManager::new();
        mgr.begin(Some("open")).unwrap();
        assert!(matches!(
            save(&mgr),
            Err(CodecError::State(HistoryError::TransactionOpen))
        ));
        mgr.end().unwrap();
    }

    #[test]
    fn restore_rejects_wrong_schema() {
        let records = vec![
            SavedRecord::Header {
                schema_version: "retrace-history-v0".into(),
                history_limit: None,
            },
            SavedRecord::RedoMarker { count: 0 },
            SavedRecord::End,
        ];
        let mut mgr = UndoManager::new();
        assert!(matches!(
            restore(&mut mgr, &records, &registry()),
            Err(CodecError::SchemaVersion(_))
        ));
    }

    #[test]
    fn restore_rejects_truncated_stream() {
        let mgr = populated_manager();
        let mut records = save(&mgr).unwrap();
        records.pop();
        let mut restored = UndoManager::new();
        assert!(matches!(
            restore(&mut restored, &records, &registry()),
            Err(CodecError::Truncated)
        ));
        // Failure left the target untouched.
        assert_eq!(restored.count_undo(), 0);
    }

    #[test]
    fn restore_rejects_redo_count_mismatch() {
        let records = vec![
            SavedRecord::Header {
                schema_version: SCHEMA_VERSION.into(),
                history_limit: Some(20),
            },
            SavedRecord::RedoMarker { count: 2 },
            SavedRecord::End,
        ];
        let mut mgr = UndoManager::new();
        assert!(matches!(
            restore(&mut mgr, &records, &registry()),
            Err(CodecError::BadRecord(_))
        ));
    }

    #[test]
    fn restore_rejects_dataless_transaction() {
        let records = vec![
            SavedRecord::Header {
                schema_version: SCHEMA_VERSION.into(),
                history_limit: Some(20),
            },
            SavedRecord::UndoState(SavedTransaction {
                commit_id: CommitId(7),
                can_merge: true,
                executed: false,
                label: None,
                ops: Vec::new(),
            }),
            SavedRecord::RedoMarker { count: 0 },
            SavedRecord::End,
        ];
        let mut mgr = UndoManager::new();
        assert!(matches!(
            restore(&mut mgr, &records, &registry()),
            Err(CodecError::BadRecord(_))
        ));
        assert_eq!(mgr.count_undo(), 0);
    }

    #[test]
    fn restore_rejects_unknown_op_kind() {
        let mgr = populated_manager();
        let records = save(&mgr).unwrap();
        let empty = OpRegistry::new();
        let mut restored = UndoManager::new();
        assert!(matches!(
            restore(&mut restored, &records, &empty),
            Err(CodecError::UnknownOpKind(_))
        ));
    }

    #[test]
    fn jsonl_round_trip() {
        let mgr = populated_manager();
        let mut buf = Vec::new();
        save_jsonl(&mgr, &mut buf).unwrap();
        let text = String::from_utf8(buf.clone()).unwrap();
        assert_eq!(text.lines().count(), 6);
        assert!(text.lines().next().unwrap().contains(SCHEMA_VERSION));

        let mut restored = UndoManager::new();
        restore_jsonl(&mut restored, buf.as_slice(), &registry()).unwrap();
        assert_eq!(restored.count_undo(), 2);
        assert_eq!(restored.count_redo(), 1);
    }

    #[test]
    fn jsonl_skips_blank_lines() {
        let mgr = populated_manager();
        let mut buf = Vec::new();
        save_jsonl(&mgr, &mut buf).unwrap();
        let padded = String::from_utf8(buf).unwrap().replace('\n', "\n\n");

        let mut restored = UndoManager::new();
        restore_jsonl(&mut restored, padded.as_bytes(), &registry()).unwrap();
        assert_eq!(restored.count_undo(), 2);
    }
}
