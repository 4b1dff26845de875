#![forbid(unsafe_code)]

//! Undoable four-function calculator built on the `retrace` engine.
//!
//! The calculator keeps a single running value on a shared [`ValueBus`].
//! Each keypress applies an arithmetic step and records a [`CalcOp`] in the
//! history; undo posts the inverse result back to the bus, redo re-posts
//! the recorded result. Operations never recompute, they replay the values
//! captured at edit time, so divide-then-undo lands exactly where it
//! started even when the division truncated.

use std::any::Any;
use std::fmt;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use retrace::{CodecError, MergeMode, OpRegistry, Operation, UndoManager};

// ============================================================================
// Value bus
// ============================================================================

type ValueListener = Box<dyn Fn(i64) + Send + Sync>;

/// Shared holder for the calculator's current value. Operations post to it
/// during replay; subscribers (display, logging) are notified of every
/// posted value.
#[derive(Default)]
pub struct ValueBus {
    current: Mutex<i64>,
    listeners: Mutex<Vec<ValueListener>>,
}

impl fmt::Debug for ValueBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValueBus")
            .field("current", &self.read())
            .finish()
    }
}

impl ValueBus {
    #[must_use]
    pub fn new(initial: i64) -> Arc<Self> {
        Arc::new(Self {
            current: Mutex::new(initial),
            listeners: Mutex::new(Vec::new()),
        })
    }

    /// Register a change listener. Listeners run synchronously on every
    /// post, in subscription order.
    pub fn subscribe(&self, listener: impl Fn(i64) + Send + Sync + 'static) {
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.push(Box::new(listener));
        }
    }

    pub fn post(&self, value: i64) {
        if let Ok(mut current) = self.current.lock() {
            *current = value;
        }
        if let Ok(listeners) = self.listeners.lock() {
            for listener in listeners.iter() {
                listener(value);
            }
        }
    }

    #[must_use]
    pub fn read(&self) -> i64 {
        self.current.lock().map(|v| *v).unwrap_or(0)
    }
}

// ============================================================================
// Arithmetic steps
// ============================================================================

/// The four supported operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArithKind {
    Plus,
    Minus,
    Multiply,
    Divide,
}

impl ArithKind {
    /// Parse an operator symbol as typed at the prompt.
    #[must_use]
    pub fn from_symbol(symbol: char) -> Option<Self> {
        match symbol {
            '+' => Some(Self::Plus),
            '-' => Some(Self::Minus),
            '*' => Some(Self::Multiply),
            '/' => Some(Self::Divide),
            _ => None,
        }
    }

    #[must_use]
    pub fn symbol(self) -> char {
        match self {
            Self::Plus => '+',
            Self::Minus => '-',
            Self::Multiply => '*',
            Self::Divide => '/',
        }
    }

    fn apply(self, current: i64, operand: i64) -> i64 {
        match self {
            Self::Plus => current.wrapping_add(operand),
            Self::Minus => current.wrapping_sub(operand),
            Self::Multiply => current.wrapping_mul(operand),
            Self::Divide => current.wrapping_div(operand),
        }
    }
}

impl fmt::Display for ArithKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.symbol())
    }
}

/// Serialized payload of a [`CalcOp`].
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CalcOpPayload {
    kind: ArithKind,
    result: i64,
    operand: i64,
}

/// One recorded arithmetic step.
///
/// Stores the result it produced and the operand it used; undo derives the
/// pre-step value from those instead of trusting the bus.
pub struct CalcOp {
    kind: ArithKind,
    result: i64,
    operand: i64,
    bus: Arc<ValueBus>,
}

impl CalcOp {
    fn new(kind: ArithKind, result: i64, operand: i64, bus: &Arc<ValueBus>) -> Box<Self> {
        Box::new(Self {
            kind,
            result,
            operand,
            bus: Arc::clone(bus),
        })
    }

    /// The value this step left on the bus.
    #[must_use]
    pub fn result(&self) -> i64 {
        self.result
    }

    /// The value the bus held before this step.
    fn previous(&self) -> i64 {
        match self.kind {
            ArithKind::Plus => self.result.wrapping_sub(self.operand),
            ArithKind::Minus => self.result.wrapping_add(self.operand),
            ArithKind::Multiply => self.result.wrapping_div(self.operand),
            ArithKind::Divide => self.result.wrapping_mul(self.operand),
        }
    }
}

impl Operation for CalcOp {
    fn commit(&mut self) {
        // The result was posted when the step was applied; nothing to do at
        // finalize time.
    }

    fn undo(&mut self) {
        let previous = self.previous();
        tracing::trace!(op = %self.kind, value = previous, "reverting step");
        self.bus.post(previous);
    }

    fn redo(&mut self) {
        tracing::trace!(op = %self.kind, value = self.result, "replaying step");
        self.bus.post(self.result);
    }

    fn kind(&self) -> &'static str {
        "calc-op"
    }

    fn encode(&self) -> serde_json::Value {
        let payload = CalcOpPayload {
            kind: self.kind,
            result: self.result,
            operand: self.operand,
        };
        serde_json::to_value(payload).unwrap_or(serde_json::Value::Null)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn debug_name(&self) -> &'static str {
        "CalcOp"
    }
}

/// Register the calculator's operation decoders against `bus`.
pub fn register_ops(registry: &mut OpRegistry, bus: Arc<ValueBus>) {
    registry.register("calc-op", move |payload| {
        let payload: CalcOpPayload =
            serde_json::from_value(payload.clone()).map_err(CodecError::from)?;
        // `apply` never records a zero operand; a record carrying one is
        // corrupt, and inverting it would divide by zero.
        if payload.operand == 0 {
            return Err(CodecError::BadRecord(
                "calc-op with zero operand is not invertible".into(),
            ));
        }
        Ok(CalcOp::new(
            payload.kind,
            payload.result,
            payload.operand,
            &bus,
        ))
    });
}

// ============================================================================
// Calculator host
// ============================================================================

/// Interactive calculator state: the bus plus the undo history driving it.
pub struct Calculator {
    bus: Arc<ValueBus>,
    history: UndoManager,
}

impl Calculator {
    #[must_use]
    pub fn new() -> Self {
        Self {
            bus: ValueBus::new(0),
            history: UndoManager::new(),
        }
    }

    #[must_use]
    pub fn value(&self) -> i64 {
        self.bus.read()
    }

    #[must_use]
    pub fn bus(&self) -> &Arc<ValueBus> {
        &self.bus
    }

    #[must_use]
    pub fn history(&self) -> &UndoManager {
        &self.history
    }

    pub fn history_mut(&mut self) -> &mut UndoManager {
        &mut self.history
    }

    /// Apply one arithmetic step and record it as an undoable edit.
    ///
    /// A zero operand is skipped without touching history: the step would
    /// not be invertible. Multiplying by zero destroys the prior value and
    /// dividing by zero is undefined; plus and minus with zero change
    /// nothing worth recording.
    pub fn apply(&mut self, kind: ArithKind, operand: i64) -> Result<(), retrace::HistoryError> {
        if operand == 0 {
            tracing::debug!(op = %kind, "skipping zero operand");
            return Ok(());
        }
        let result = kind.apply(self.bus.read(), operand);
        let label = format!("{kind}{operand}");

        self.history.begin(Some(&label))?;
        self.history
            .add_operation(CalcOp::new(kind, result, operand, &self.bus), MergeMode::None)?;
        self.history.end()?;

        self.bus.post(result);
        tracing::debug!(op = %kind, operand, result, "applied step");
        Ok(())
    }

    /// Undo up to `count` steps. Returns how many were undone.
    pub fn undo(&mut self, count: usize) -> Result<usize, retrace::HistoryError> {
        self.history.undo(count)
    }

    /// Redo up to `count` steps. Returns how many were redone.
    pub fn redo(&mut self, count: usize) -> Result<usize, retrace::HistoryError> {
        self.history.redo(count)
    }

    /// Persist the history as JSON Lines.
    pub fn save<W: std::io::Write>(&self, out: W) -> Result<(), CodecError> {
        retrace::save_jsonl(&self.history, out)
    }

    /// Restore the history from JSON Lines. The current value is left
    /// alone; redo/undo from the restored history repositions it.
    pub fn load<R: std::io::BufRead>(&mut self, input: R) -> Result<(), CodecError> {
        let mut registry = OpRegistry::new();
        register_ops(&mut registry, Arc::clone(&self.bus));
        retrace::restore_jsonl(&mut self.history, input, &registry)
    }
}

impl Default for Calculator {
    fn default() -> Self {
        Self::new()
    }
}
