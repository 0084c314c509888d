//! Background loops: heartbeat monitor, sweeper and lifecycle event loop.
//!
//! The monitor and the sweeper tick independently of each other and of the
//! task operations. Both report through the lifecycle channel; the event
//! loop is the only consumer and applies each event to the broker.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::broker::Broker;
use crate::events::LifecycleReceiver;

/// Handles to the spawned loops.
pub struct MonitorHandles {
    pub heartbeat: JoinHandle<()>,
    pub sweeper: JoinHandle<()>,
    pub events: JoinHandle<()>,
}

impl MonitorHandles {
    /// Wait for all loops to stop.
    pub async fn join(self) {
        let _ = tokio::join!(self.heartbeat, self.sweeper, self.events);
    }
}

/// Spawn the background loops. They stop when `shutdown` is cancelled.
pub fn spawn(broker: Broker, events: LifecycleReceiver, shutdown: CancellationToken) -> MonitorHandles {
    let heartbeat_every = broker.config().heartbeat_interval();
    let sweep_every = broker.config().sweep_interval();

    let heartbeat = tokio::spawn(run_heartbeat_monitor(
        broker.clone(),
        heartbeat_every,
        shutdown.clone(),
    ));
    let sweeper = tokio::spawn(run_sweeper(broker.clone(), sweep_every, shutdown.clone()));
    let events = tokio::spawn(run_event_loop(broker, events, shutdown));

    MonitorHandles {
        heartbeat,
        sweeper,
        events,
    }
}

async fn run_heartbeat_monitor(broker: Broker, every: Duration, shutdown: CancellationToken) {
    let mut timer = tokio::time::interval(every);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(interval_secs = every.as_secs(), "Heartbeat monitor started");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = timer.tick() => broker.check_heartbeats().await,
        }
    }
    debug!("Heartbeat monitor stopped");
}

async fn run_sweeper(broker: Broker, every: Duration, shutdown: CancellationToken) {
    let mut timer = tokio::time::interval(every);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = timer.tick() => broker.sweep().await,
        }
    }
    debug!("Sweeper stopped");
}

async fn run_event_loop(broker: Broker, mut events: LifecycleReceiver, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => broker.handle_event(event).await,
                None => break,
            },
        }
    }
    debug!("Lifecycle event loop stopped");
}
