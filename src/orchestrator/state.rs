//! Lifecycle state and its observer registry.

use crate::core::SupervisorError;
use crate::upgrade::InstallPhase;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

/// Externally visible state of the supervised core.
#[derive(Debug, Clone)]
pub enum LifecycleState {
    Idle,
    Starting,
    Running {
        version: String,
        pid: u32,
        port: u16,
        started_at: DateTime<Utc>,
    },
    Stopping,
    /// Published again for every install phase
    Installing {
        version: String,
        phase: InstallPhase,
    },
    /// A freshly installed version is being dry-run by the given instance
    Testing {
        version: String,
        pid: u32,
        port: u16,
    },
    RollingBack {
        from: String,
        to: String,
    },
    Error(SupervisorError),
}

impl LifecycleState {
    #[must_use]
    pub const fn is_running(&self) -> bool {
        matches!(self, Self::Running { .. })
    }

    #[must_use]
    pub const fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    /// Short lowercase name, e.g. `running`.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::Running { .. } => "running",
            Self::Stopping => "stopping",
            Self::Installing { .. } => "installing",
            Self::Testing { .. } => "testing",
            Self::RollingBack { .. } => "rolling_back",
            Self::Error(_) => "error",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running {
                version,
                pid,
                port,
                ..
            } => write!(f, "running {version} (pid {pid}, port {port})"),
            Self::Installing {
                version,
                phase,
            } => write!(f, "installing {version}: {phase}"),
            Self::Testing {
                version,
                pid,
                port,
            } => write!(f, "testing {version} (pid {pid}, port {port})"),
            Self::RollingBack {
                from,
                to,
            } => write!(f, "rolling back from {from} to {to}"),
            Self::Error(e) => write!(f, "error: {e}"),
            other => f.write_str(other.name()),
        }
    }
}

/// Receives every state published after subscribing, starting with the state
/// current at subscription time.
pub type StateReceiver = mpsc::UnboundedReceiver<LifecycleState>;

struct Registry {
    current: LifecycleState,
    next_id: u64,
    subscribers: HashMap<u64, mpsc::UnboundedSender<LifecycleState>>,
}

/// Fan-out of [`LifecycleState`] transitions.
///
/// A new subscriber immediately receives the current state; afterwards every
/// published state is delivered in order. Dropping the receiver unsubscribes.
pub struct StateChannel {
    registry: Mutex<Registry>,
}

impl StateChannel {
    #[must_use]
    pub fn new(initial: LifecycleState) -> Self {
        Self {
            registry: Mutex::new(Registry {
                current: initial,
                next_id: 0,
                subscribers: HashMap::new(),
            }),
        }
    }

    fn registry(&self) -> std::sync::MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    #[must_use]
    pub fn current(&self) -> LifecycleState {
        self.registry().current.clone()
    }

    /// Record `state` and deliver it to every live subscriber.
    pub fn publish(&self, state: LifecycleState) {
        debug!("Lifecycle state: {}", state);
        let mut registry = self.registry();
        registry.current = state.clone();
        registry.subscribers.retain(|_, tx| tx.send(state.clone()).is_ok());
    }

    pub fn subscribe(&self) -> StateReceiver {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut registry = self.registry();
        if tx.send(registry.current.clone()).is_ok() {
            let id = registry.next_id;
            registry.next_id += 1;
            registry.subscribers.insert(id, tx);
        }
        rx
    }

    /// Number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        let mut registry = self.registry();
        registry.subscribers.retain(|_, tx| !tx.is_closed());
        registry.subscribers.len()
    }
}

impl fmt::Debug for StateChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateChannel").field("current", &self.current()).finish_non_exhaustive()
    }
}
