use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{KnowledgeStore, RunContext};
use crate::error::Result;
use crate::plan::StepKind;
use crate::store;

/// Event name used for whole-run progress records.
pub const OVERALL: &str = "overall";

/// Outcome or lifecycle marker of an event.
///
/// Serialized as a plain string; nonzero exits become `exit_<code>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventStatus {
    Success,
    Error,
    Exit(i32),
    Missing,
    Warning,
    Skipped,
    Blocked,
    HashMismatch,
    Running,
    Progress,
    Inserted,
    Other(String),
}

/// Knowledge counter an event status is tallied under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bucket {
    Success,
    Error,
    Exit,
    Missing,
    Warning,
    Other,
}

impl EventStatus {
    /// `success` for zero, `exit_<code>` otherwise.
    pub fn from_exit_code(code: i32) -> Self {
        if code == 0 {
            Self::Success
        } else {
            Self::Exit(code)
        }
    }

    pub fn bucket(&self) -> Bucket {
        match self {
            Self::Success => Bucket::Success,
            Self::Error => Bucket::Error,
            Self::Exit(_) => Bucket::Exit,
            Self::Missing => Bucket::Missing,
            Self::Warning => Bucket::Warning,
            _ => Bucket::Other,
        }
    }

    /// Transient markers, as opposed to a step's final outcome.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Running | Self::Progress | Self::Inserted)
    }

    /// Terminal outcomes that count as a failed step.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Self::Error | Self::Exit(_) | Self::Missing | Self::Blocked | Self::HashMismatch
        )
    }
}

impl From<String> for EventStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "success" => Self::Success,
            "error" => Self::Error,
            "missing" => Self::Missing,
            "warning" => Self::Warning,
            "skipped" => Self::Skipped,
            "blocked" => Self::Blocked,
            "hash_mismatch" => Self::HashMismatch,
            "running" => Self::Running,
            "progress" => Self::Progress,
            "inserted" => Self::Inserted,
            other => match other.strip_prefix("exit_").and_then(|c| c.parse().ok()) {
                Some(code) => Self::Exit(code),
                None => Self::Other(s),
            },
        }
    }
}

impl From<EventStatus> for String {
    fn from(status: EventStatus) -> Self {
        status.to_string()
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => f.write_str("success"),
            Self::Error => f.write_str("error"),
            Self::Exit(code) => write!(f, "exit_{}", code),
            Self::Missing => f.write_str("missing"),
            Self::Warning => f.write_str("warning"),
            Self::Skipped => f.write_str("skipped"),
            Self::Blocked => f.write_str("blocked"),
            Self::HashMismatch => f.write_str("hash_mismatch"),
            Self::Running => f.write_str("running"),
            Self::Progress => f.write_str("progress"),
            Self::Inserted => f.write_str("inserted"),
            Self::Other(s) => f.write_str(s),
        }
    }
}

/// Kind-specific event payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Details {
    None,
    /// A step started or reported progress
    Step {
        index: usize,
        total: usize,
        kind: StepKind,
        progress: u8,
    },
    /// Whole-run progress
    Overall {
        done: usize,
        total: usize,
        percent: u8,
    },
    /// Terminal outcome of a step
    Outcome {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
        duration_ms: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<PathBuf>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(default)]
        timed_out: bool,
    },
    /// Signature sweep over a driver folder
    Signatures {
        checked: usize,
        ok: usize,
        bad: usize,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        bad_files: Vec<PathBuf>,
        duration_ms: u64,
    },
    /// Driver package install
    Driver {
        path: PathBuf,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        provider: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        class: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        version: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
        duration_ms: u64,
    },
    /// Steps spliced into the plan by adaptation
    Inserted { after: usize, steps: Vec<String> },
    /// Boot-time resume registration
    Resume {
        method: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        identifier: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Free-form note
    Note { message: String },
}

/// One audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub timestamp: DateTime<Utc>,
    pub step: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<StepKind>,
    pub status: EventStatus,
    pub details: Details,
}

impl Event {
    pub fn new(step: impl Into<String>, status: EventStatus, details: Details) -> Self {
        Self {
            timestamp: Utc::now(),
            step: step.into(),
            kind: None,
            status,
            details,
        }
    }

    pub fn with_kind(mut self, kind: StepKind) -> Self {
        self.kind = Some(kind);
        self
    }
}

/// Append-only audit trail of one run, feeding the knowledge store.
///
/// The whole array is rewritten on each append; a single orchestrator
/// process owns a run directory.
#[derive(Debug)]
pub struct EventLog {
    path: PathBuf,
    events: Vec<Event>,
    knowledge: KnowledgeStore,
}

impl EventLog {
    pub fn open(ctx: &RunContext, knowledge: KnowledgeStore) -> Result<Self> {
        let path = ctx.events_path();
        let events = store::read_json(&path)?.unwrap_or_default();
        Ok(Self {
            path,
            events,
            knowledge,
        })
    }

    /// Persist `event`, then count it in the knowledge store.
    pub fn append(&mut self, event: Event) -> Result<()> {
        let step = event.step.clone();
        let status = event.status.clone();
        self.events.push(event);
        store::write_json_atomic(&self.path, &self.events)?;
        self.knowledge.record_outcome(&step, &status)
    }

    /// The last `n` events, oldest first.
    pub fn read_recent(&self, n: usize) -> &[Event] {
        let start = self.events.len().saturating_sub(n);
        &self.events[start..]
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn knowledge(&self) -> &KnowledgeStore {
        &self.knowledge
    }
}
