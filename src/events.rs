//! Host lifecycle signals: connectivity, visibility and teardown.
//!
//! The agent never reaches for ambient globals. It is handed an
//! [`EventSource`] at construction, subscribes once, and drops the
//! subscription when destroyed.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast;

/// Buffered events per subscriber before the slowest one starts lagging.
const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// Events the host forwards to the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostEvent {
    Online,
    Offline,
    Hidden,
    Visible,
    Unload,
}

impl std::str::FromStr for HostEvent {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "online" => Ok(Self::Online),
            "offline" => Ok(Self::Offline),
            "hidden" => Ok(Self::Hidden),
            "visible" => Ok(Self::Visible),
            "unload" => Ok(Self::Unload),
            other => anyhow::bail!(
                "Unknown host event '{}'. Valid events: online, offline, hidden, visible, unload",
                other
            ),
        }
    }
}

/// Injected source of host events.
pub trait EventSource: Send + Sync {
    /// Connectivity at the time of the call.
    fn is_online(&self) -> bool;

    /// New subscription. Dropping the receiver unsubscribes.
    fn subscribe(&self) -> broadcast::Receiver<HostEvent>;
}

/// Broadcast-backed event source the host drives with [`HostSignals::emit`].
#[derive(Debug)]
pub struct HostSignals {
    tx: broadcast::Sender<HostEvent>,
    online: AtomicBool,
}

impl Default for HostSignals {
    fn default() -> Self {
        Self::new(true)
    }
}

impl HostSignals {
    pub fn new(online: bool) -> Self {
        let (tx, _) = broadcast::channel(DEFAULT_CHANNEL_CAPACITY);
        Self {
            tx,
            online: AtomicBool::new(online),
        }
    }

    /// Publish an event. Connectivity events also update [`EventSource::is_online`].
    /// Returns the number of subscribers that received it.
    pub fn emit(&self, event: HostEvent) -> usize {
        match event {
            HostEvent::Online => self.online.store(true, Ordering::SeqCst),
            HostEvent::Offline => self.online.store(false, Ordering::SeqCst),
            _ => {}
        }
        self.tx.send(event).unwrap_or(0)
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl EventSource for HostSignals {
    fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    fn subscribe(&self) -> broadcast::Receiver<HostEvent> {
        self.tx.subscribe()
    }
}
