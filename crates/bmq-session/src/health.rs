//! Host-health bridge.
//!
//! Turns host-health transitions into queue suspension and resumption.
//! Per-queue outcomes are reported before the host-level event, and all of
//! them go through the first dispatch lane so the callback sees them in
//! that order.

use std::sync::Arc;

use bmq_core::{HostHealth, HostHealthMonitor, QueueEvent, SessionEvent};
use tokio::sync::{broadcast, oneshot};

use crate::session::Shared;

/// Start following `monitor` for the session.
pub(crate) fn start_bridge(
    shared: &Arc<Shared>,
    monitor: HostHealthMonitor,
    rx: broadcast::Receiver<HostHealth>,
    initial: HostHealth,
) {
    if initial == HostHealth::Unhealthy {
        *shared.host_health.lock() = HostHealth::Unhealthy;
        shared.dispatcher.push_local(SessionEvent::HostUnhealthy(None));
    }

    let (stop_tx, stop_rx) = oneshot::channel();
    *shared.bridge_stop.lock() = Some(stop_tx);
    let bridge = Arc::clone(shared);
    shared
        .runtime
        .spawn(async move { run(&bridge, &monitor, rx, stop_rx).await });
}

async fn run(
    shared: &Arc<Shared>,
    monitor: &HostHealthMonitor,
    mut rx: broadcast::Receiver<HostHealth>,
    mut stop_rx: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = &mut stop_rx => break,
            received = rx.recv() => match received {
                Ok(health) => apply(shared, health).await,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("Missed {skipped} host health updates, resyncing");
                    apply(shared, monitor.state()).await;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
    tracing::debug!("Host health bridge for session {} stopped", shared.id);
}

async fn apply(shared: &Shared, health: HostHealth) {
    if !shared.is_connected() {
        return;
    }
    {
        let mut current = shared.host_health.lock();
        if *current == health {
            return;
        }
        *current = health;
    }
    match health {
        HostHealth::Unhealthy => suspend_all(shared).await,
        HostHealth::Healthy => resume_all(shared).await,
    }
}

async fn suspend_all(shared: &Shared) {
    tracing::info!("Host became unhealthy, suspending queues");
    let uris = shared.registry.lock().suspendable();
    let timeout = shared.timeouts.configure_queue;
    let mut any_failed = false;

    for uri in uris {
        match shared.engine.suspend_queue(&uri, timeout).await {
            Ok(()) => {
                shared.registry.lock().set_suspended(&uri, true);
                shared
                    .dispatcher
                    .push_local(SessionEvent::QueueSuspended(QueueEvent::new(uri)));
            }
            Err(e) => {
                tracing::warn!("Failed to suspend queue {uri}: {e}");
                any_failed = true;
                shared
                    .dispatcher
                    .push_local(SessionEvent::QueueSuspendFailed(QueueEvent::with_message(
                        uri,
                        e.to_string(),
                    )));
            }
        }
    }

    shared.dispatcher.push_local(SessionEvent::HostUnhealthy(None));
    if any_failed {
        tracing::warn!("Requesting reconnect after failed queue suspension");
        shared.engine.request_reconnect();
    }
}

async fn resume_all(shared: &Shared) {
    tracing::info!("Host health restored, resuming queues");
    let uris = shared.registry.lock().suspended_queues();
    let timeout = shared.timeouts.configure_queue;

    for uri in uris {
        match shared.engine.resume_queue(&uri, timeout).await {
            Ok(()) => {
                shared.registry.lock().set_suspended(&uri, false);
                shared
                    .dispatcher
                    .push_local(SessionEvent::QueueResumed(QueueEvent::new(uri)));
            }
            Err(e) => {
                tracing::warn!("Failed to resume queue {uri}: {e}");
                shared
                    .dispatcher
                    .push_local(SessionEvent::QueueResumeFailed(QueueEvent::with_message(
                        uri,
                        e.to_string(),
                    )));
            }
        }
    }

    shared
        .dispatcher
        .push_local(SessionEvent::HostHealthRestored(None));
}
