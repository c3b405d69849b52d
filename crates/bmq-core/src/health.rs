//! Host-health signal source.

use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;

/// Health of the host the session runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum HostHealth {
    #[default]
    Healthy,
    Unhealthy,
}

#[derive(Debug)]
struct Inner {
    state: Mutex<HostHealth>,
    sender: broadcast::Sender<HostHealth>,
}

/// Manually driven host-health monitor.
///
/// Hand a clone to [`SessionOptions::host_health_monitor`] and flip it
/// from wherever the host's health is known. Only transitions are
/// broadcast; repeating the current state is a no-op.
///
/// [`SessionOptions::host_health_monitor`]: crate::options::SessionOptions::host_health_monitor
#[derive(Debug, Clone)]
pub struct HostHealthMonitor {
    inner: Arc<Inner>,
}

impl Default for HostHealthMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl HostHealthMonitor {
    /// Create a monitor reporting a healthy host.
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(HostHealth::Healthy),
                sender,
            }),
        }
    }

    pub fn set_healthy(&self) {
        self.set(HostHealth::Healthy);
    }

    pub fn set_unhealthy(&self) {
        self.set(HostHealth::Unhealthy);
    }

    fn set(&self, health: HostHealth) {
        let mut state = match self.inner.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if *state == health {
            return;
        }
        *state = health;
        tracing::debug!("Host health changed to {health:?}");
        let _ = self.inner.sender.send(health);
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> HostHealth {
        match self.inner.state.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Receiver for future transitions.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<HostHealth> {
        self.inner.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transitions_broadcast() {
        let monitor = HostHealthMonitor::new();
        let mut rx = monitor.subscribe();

        monitor.set_healthy();
        monitor.set_unhealthy();
        monitor.set_unhealthy();
        monitor.set_healthy();

        assert_eq!(rx.try_recv().unwrap(), HostHealth::Unhealthy);
        assert_eq!(rx.try_recv().unwrap(), HostHealth::Healthy);
        assert!(rx.try_recv().is_err());
        assert_eq!(monitor.state(), HostHealth::Healthy);
    }

    #[test]
    fn test_clones_share_state() {
        let monitor = HostHealthMonitor::default();
        let other = monitor.clone();
        other.set_unhealthy();
        assert_eq!(monitor.state(), HostHealth::Unhealthy);
    }

    #[test]
    fn test_subscriber_sees_updates_async() {
        let monitor = HostHealthMonitor::new();
        let mut rx = monitor.subscribe();
        monitor.set_unhealthy();
        let health = tokio_test::block_on(rx.recv()).unwrap();
        assert_eq!(health, HostHealth::Unhealthy);
    }
}
