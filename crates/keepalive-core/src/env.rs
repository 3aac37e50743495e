use std::time::Duration;

use keepalive_protocol::{EnvDelta, EnvironmentSnapshot};

/// Minimum spacing between env deliveries the core expects from its host.
pub const ENV_DEBOUNCE: Duration = Duration::from_millis(250);

/// Connectivity edge observed by one env update.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NetworkEdge {
    Up,
    Down,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EnvUpdate {
    pub changed: bool,
    pub network_edge: Option<NetworkEdge>,
}

/// Holds the latest environment view pushed by the host.
#[derive(Clone, Debug, Default)]
pub struct EnvProbe {
    snapshot: EnvironmentSnapshot,
    updates: u64,
}

impl EnvProbe {
    pub fn new(initial: EnvironmentSnapshot) -> Self {
        Self {
            snapshot: initial,
            updates: 0,
        }
    }

    pub fn snapshot(&self) -> &EnvironmentSnapshot {
        &self.snapshot
    }

    /// Number of updates received so far.
    pub fn updates(&self) -> u64 {
        self.updates
    }

    pub fn replace(&mut self, snapshot: EnvironmentSnapshot) -> EnvUpdate {
        let was_up = self.snapshot.network_available();
        let changed = self.snapshot != snapshot;
        self.snapshot = snapshot;
        self.finish(was_up, changed)
    }

    pub fn apply(&mut self, delta: &EnvDelta) -> EnvUpdate {
        let was_up = self.snapshot.network_available();
        let changed = self.snapshot.apply(delta);
        self.finish(was_up, changed)
    }

    fn finish(&mut self, was_up: bool, changed: bool) -> EnvUpdate {
        self.updates += 1;
        let now_up = self.snapshot.network_available();
        let network_edge = match (was_up, now_up) {
            (false, true) => Some(NetworkEdge::Up),
            (true, false) => Some(NetworkEdge::Down),
            _ => None,
        };
        EnvUpdate {
            changed,
            network_edge,
        }
    }
}

/// Folds bursts of raw deltas into one delivery per window.
#[derive(Clone, Debug, Default)]
pub struct EnvCoalescer {
    pending: Option<EnvDelta>,
}

impl EnvCoalescer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffers `delta`; returns true when it opened a new window.
    pub fn push(&mut self, delta: EnvDelta) -> bool {
        match self.pending.as_mut() {
            Some(pending) => {
                pending.merge(delta);
                false
            }
            None => {
                self.pending = Some(delta);
                true
            }
        }
    }

    pub fn take(&mut self) -> Option<EnvDelta> {
        self.pending.take()
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }
}
