//! Dirty/clean state tracking for a single draft.
//!
//! `DraftState` is the one piece of shared mutable state the agent owns.
//! `DraftPhase` is a read-only view of the same flags as a state-machine
//! label, and `SaveStatus` is the vocabulary of the status-text channel.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Flat mapping from field identifier to value. The agent never looks inside.
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// Snapshot of everything the agent knows about its document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DraftState {
    /// Whether periodic autosave is active
    pub is_enabled: bool,
    /// Local data differs from the last durable save
    pub is_dirty: bool,
    /// A durable save is in flight
    pub is_saving: bool,
    /// Last known connectivity
    pub is_online: bool,
    /// Latest uncommitted snapshot
    pub pending_payload: Option<Payload>,
    /// Consecutive failed attempts for the current payload
    pub retry_count: u32,
    /// Set only on success
    pub last_save_time: Option<DateTime<Utc>>,
    /// `version` reported by the endpoint for the last successful save
    pub last_version: Option<i64>,
    /// Successful durable saves performed by this agent
    pub save_count: u64,
    /// Bumped on every edit; lets a finishing save tell whether it is stale
    pub revision: u64,
}

impl DraftState {
    pub fn new(is_enabled: bool, is_online: bool) -> Self {
        Self {
            is_enabled,
            is_dirty: false,
            is_saving: false,
            is_online,
            pending_payload: None,
            retry_count: 0,
            last_save_time: None,
            last_version: None,
            save_count: 0,
            revision: 0,
        }
    }

    /// Record an edit. A supplied payload replaces the pending one wholesale.
    pub fn record_edit(&mut self, payload: Option<Payload>) {
        if let Some(payload) = payload {
            self.pending_payload = Some(payload);
        }
        self.is_dirty = true;
        self.revision = self.revision.wrapping_add(1);
    }

    /// Drop pending data and return to a clean slate (used on success and teardown).
    pub fn clear_pending(&mut self) {
        self.pending_payload = None;
        self.is_dirty = false;
        self.retry_count = 0;
    }

    /// Hold `payload` for a later attempt without clobbering a newer edit.
    pub fn retain(&mut self, payload: Payload) {
        if self.pending_payload.is_none() {
            self.pending_payload = Some(payload);
        }
        self.is_dirty = true;
    }

    /// State-machine label derived from the flags.
    pub fn phase(&self) -> DraftPhase {
        if self.is_saving {
            return DraftPhase::Saving;
        }
        if self.retry_count > 0 {
            return DraftPhase::Retrying(self.retry_count);
        }
        if self.is_dirty && !self.is_online {
            return DraftPhase::OfflinePending;
        }
        if self.is_dirty {
            DraftPhase::Dirty
        } else {
            DraftPhase::Clean
        }
    }
}

impl Default for DraftState {
    fn default() -> Self {
        Self::new(true, true)
    }
}

/// Per-document state machine positions.
///
/// | From            | Event                          | To              |
/// |-----------------|--------------------------------|-----------------|
/// | Clean           | edit                           | Dirty           |
/// | Dirty           | tick / hidden / manual         | Saving          |
/// | Dirty           | tick while offline             | OfflinePending  |
/// | OfflinePending  | connectivity restored          | Saving          |
/// | Saving          | success                        | Clean           |
/// | Saving          | failure, retries remain        | Retrying(n+1)   |
/// | Retrying(n)     | delayed attempt fires          | Saving          |
/// | Retrying(max)   | failure                        | Dirty           |
///
/// Exhausted retries are reported as [`SaveStatus::Error`] only. The payload
/// is retained, so the phase falls back to `Dirty`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "phase", content = "attempt")]
pub enum DraftPhase {
    Clean,
    Dirty,
    Saving,
    Retrying(u32),
    OfflinePending,
}

/// Values pushed through the status-text channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SaveStatus {
    Clean,
    Dirty,
    Saving,
    Retrying,
    Offline,
    Error,
}

impl std::fmt::Display for SaveStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SaveStatus::Clean => write!(f, "clean"),
            SaveStatus::Dirty => write!(f, "dirty"),
            SaveStatus::Saving => write!(f, "saving"),
            SaveStatus::Retrying => write!(f, "retrying"),
            SaveStatus::Offline => write!(f, "offline"),
            SaveStatus::Error => write!(f, "error"),
        }
    }
}

impl std::str::FromStr for SaveStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "clean" => Ok(SaveStatus::Clean),
            "dirty" => Ok(SaveStatus::Dirty),
            "saving" => Ok(SaveStatus::Saving),
            "retrying" => Ok(SaveStatus::Retrying),
            "offline" => Ok(SaveStatus::Offline),
            "error" => Ok(SaveStatus::Error),
            _ => anyhow::bail!(
                "Invalid save status '{}'. Valid values: clean, dirty, saving, retrying, offline, error",
                s
            ),
        }
    }
}
