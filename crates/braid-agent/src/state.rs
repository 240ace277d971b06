//! The State Container: a session's versioned turns and scratch data.
//!
//! Nodes never mutate state directly. They read an immutable
//! [`StateSnapshot`] and return a [`Delta`]; the engine applies deltas one
//! at a time through [`StateContainer::apply_delta`], which checks the
//! delta's base version and bumps the version once per applied delta.

use std::sync::Arc;

use braid_core::error::{BraidError, Result};
use braid_core::event::DeltaSummary;
use braid_core::types::{Role, SessionState, Turn};

/// Point-in-time, read-only view of a session's state.
pub type StateSnapshot = Arc<SessionState>;

/// One change within a [`Delta`].
#[derive(Debug, Clone, PartialEq)]
pub enum DeltaOp {
    AppendTurn(Turn),
    SetScratch { key: String, value: serde_json::Value },
    RemoveScratch(String),
    /// Replace `turns[..through]` with a single summary turn.
    Compact { through: usize, summary: Turn },
}

/// An incremental change computed against a specific state version.
#[derive(Debug, Clone, PartialEq)]
pub struct Delta {
    pub base_version: u64,
    pub ops: Vec<DeltaOp>,
}

impl Delta {
    pub fn new(base_version: u64) -> Self {
        Self {
            base_version,
            ops: Vec::new(),
        }
    }

    /// A delta based on the given state's version.
    pub fn against(state: &SessionState) -> Self {
        Self::new(state.version)
    }

    pub fn append_turn(mut self, turn: Turn) -> Self {
        self.ops.push(DeltaOp::AppendTurn(turn));
        self
    }

    pub fn set_scratch(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.ops.push(DeltaOp::SetScratch {
            key: key.into(),
            value,
        });
        self
    }

    pub fn remove_scratch(mut self, key: impl Into<String>) -> Self {
        self.ops.push(DeltaOp::RemoveScratch(key.into()));
        self
    }

    pub fn compact(mut self, through: usize, summary: Turn) -> Self {
        self.ops.push(DeltaOp::Compact { through, summary });
        self
    }

    /// An empty delta changes nothing and is not applied.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Describe this delta for a `step-completed` event.
    pub fn summarize(&self, version: Option<u64>) -> DeltaSummary {
        let mut summary = DeltaSummary {
            version,
            ..Default::default()
        };
        for op in &self.ops {
            match op {
                DeltaOp::AppendTurn(_) => summary.turns_appended += 1,
                DeltaOp::SetScratch { key, .. } | DeltaOp::RemoveScratch(key) => {
                    if !summary.scratch_keys.contains(key) {
                        summary.scratch_keys.push(key.clone());
                    }
                }
                DeltaOp::Compact { through, .. } => summary.compacted = Some(*through),
            }
        }
        summary
    }
}

/// Owner of one session's state. Snapshots are cheap `Arc` clones, so a
/// node holding a snapshot never observes a later delta.
#[derive(Debug, Clone, Default)]
pub struct StateContainer {
    current: Arc<SessionState>,
}

impl StateContainer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_state(state: SessionState) -> Self {
        Self {
            current: Arc::new(state),
        }
    }

    pub fn version(&self) -> u64 {
        self.current.version
    }

    pub fn snapshot(&self) -> StateSnapshot {
        Arc::clone(&self.current)
    }

    pub fn state(&self) -> &SessionState {
        &self.current
    }

    pub fn into_state(self) -> SessionState {
        Arc::try_unwrap(self.current).unwrap_or_else(|shared| (*shared).clone())
    }

    /// Apply a delta atomically and return the resulting version.
    ///
    /// Fails with `Conflict` when the delta was computed against another
    /// version, and with `InvalidDelta` when a compaction is malformed. In
    /// both cases the container is unchanged. Empty deltas leave the
    /// version where it is.
    pub fn apply_delta(&mut self, delta: Delta) -> Result<u64> {
        let actual = self.current.version;
        if delta.base_version != actual {
            return Err(BraidError::Conflict {
                expected: delta.base_version,
                actual,
            });
        }
        if delta.is_empty() {
            return Ok(actual);
        }

        let mut next = SessionState::clone(&self.current);
        for op in delta.ops {
            match op {
                DeltaOp::AppendTurn(turn) => next.turns.push(turn),
                DeltaOp::SetScratch { key, value } => {
                    next.scratch.insert(key, value);
                }
                DeltaOp::RemoveScratch(key) => {
                    next.scratch.remove(&key);
                }
                DeltaOp::Compact { through, summary } => compact(&mut next.turns, through, summary)?,
            }
        }
        next.version = actual + 1;
        self.current = Arc::new(next);
        Ok(actual + 1)
    }
}

fn compact(turns: &mut Vec<Turn>, through: usize, summary: Turn) -> Result<()> {
    if through == 0 || through > turns.len() {
        return Err(BraidError::InvalidDelta(format!(
            "cannot compact {} of {} turns",
            through,
            turns.len()
        )));
    }
    if !summary.summary {
        return Err(BraidError::InvalidDelta(
            "replacement turn is not marked as a summary".into(),
        ));
    }
    // A tool result must stay next to the assistant turn that requested it
    if turns.get(through).is_some_and(|t| t.role == Role::Tool) {
        return Err(BraidError::InvalidDelta(format!(
            "boundary {} would separate a tool result from its call",
            through
        )));
    }
    turns.splice(..through, std::iter::once(summary));
    Ok(())
}
