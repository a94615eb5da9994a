//! Network reachability signaling.
//!
//! The OS connectivity primitive is an external collaborator; this module
//! only defines the channel it feeds. The downloader subscribes and, while
//! waiting out a retry interval, treats a transition into
//! [`ReachabilityStatus::Reachable`] as permission to resume immediately
//! instead of sleeping out the backoff. That is an optimization for the
//! "network just came back" case, not a correctness requirement; without a
//! monitor the timer alone drives retries.

use tokio::sync::watch;

/// Connectivity as reported by the platform integration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReachabilityStatus {
    /// No observation yet.
    Unknown,
    /// The update origin is not reachable.
    NotReachable,
    /// The update origin is reachable.
    Reachable,
}

/// Publisher side of the reachability channel.
///
/// The platform integration holds the monitor and calls
/// [`set_status`](Self::set_status) on connectivity transitions; any number
/// of downloaders can [`subscribe`](Self::subscribe).
#[derive(Debug)]
pub struct ReachabilityMonitor {
    sender: watch::Sender<ReachabilityStatus>,
}

impl ReachabilityMonitor {
    pub fn new() -> Self {
        Self { sender: watch::channel(ReachabilityStatus::Unknown).0 }
    }

    /// Reports a connectivity observation. Repeated identical observations
    /// are dropped so subscribers only wake on transitions.
    pub fn set_status(&self, status: ReachabilityStatus) {
        self.sender.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }

    /// The latest observation.
    pub fn status(&self) -> ReachabilityStatus {
        *self.sender.borrow()
    }

    /// Subscribes to connectivity transitions.
    pub fn subscribe(&self) -> watch::Receiver<ReachabilityStatus> {
        self.sender.subscribe()
    }
}

impl Default for ReachabilityMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_wake_on_transition_only() {
        let monitor = ReachabilityMonitor::new();
        let mut rx = monitor.subscribe();
        rx.mark_unchanged();

        monitor.set_status(ReachabilityStatus::Unknown);
        assert!(!rx.has_changed().unwrap());

        monitor.set_status(ReachabilityStatus::Reachable);
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), ReachabilityStatus::Reachable);
    }
}
