//! The bridge's main loop.
//!
//! Everything runs on one task. Each turn waits for MQTT traffic until the
//! next gear is due, then runs at most that one gear. Commands from Home
//! Assistant are handled as soon as they arrive.

use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::bridge::Bridge;
use crate::mqtt::MqttClient;
use crate::mqtt::MqttError;
use crate::mqtt::RECONNECT_INTERVAL;

/// Longest wait when nothing is scheduled
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Something the scheduler runs when it comes due.
pub trait Scheduled {
    /// When the task next wants to run; `None` if it is dormant. A deadline
    /// in the past means as soon as possible.
    fn deadline(&self) -> Option<Instant>;
}

/// Index and deadline of the task due first. Ties go to the lowest index.
pub fn earliest<T: Scheduled>(tasks: &[T]) -> Option<(usize, Instant)> {
    tasks
        .iter()
        .enumerate()
        .filter_map(|(index, task)| task.deadline().map(|deadline| (index, deadline)))
        .fold(None, |best, (index, deadline)| match best {
            Some((_, earliest)) if earliest <= deadline => best,
            _ => Some((index, deadline)),
        })
}

/// How long to wait for network traffic before the next piece of work.
pub fn wait_timeout(
    now: Instant,
    next_task: Option<Instant>,
    next_release: Option<Instant>,
) -> Duration {
    let timeout = next_task.map_or(IDLE_TIMEOUT, |deadline| deadline.saturating_duration_since(now));
    match next_release {
        Some(release) => timeout.min(release.saturating_duration_since(now)),
        None => timeout,
    }
}

async fn ensure_connected<C: MqttClient>(bridge: &mut Bridge<C>) -> Result<(), MqttError> {
    while !bridge.is_connected() {
        if let Some(event) = bridge.poll_event(RECONNECT_INTERVAL).await? {
            bridge.handle_event(event).await?;
        }
    }
    Ok(())
}

/// One turn of the loop.
pub async fn run_once<C: MqttClient>(bridge: &mut Bridge<C>) -> Result<(), MqttError> {
    ensure_connected(bridge).await?;

    let now = Instant::now();
    let next = bridge.next_deadline().map(|(_, deadline)| deadline);
    let timeout = wait_timeout(now, next, bridge.next_release());

    // Only when nothing is overdue
    if !timeout.is_zero() {
        bridge.idle().await?;
    }

    if let Some(event) = bridge.poll_event(timeout).await? {
        bridge.handle_event(event).await?;
    }

    bridge.publish_due(Instant::now()).await?;

    if let Some((index, deadline)) = bridge.next_deadline() {
        if deadline <= Instant::now() {
            debug!(address = index, "running task");
            bridge.run_task(index).await?;
        }
    }
    Ok(())
}

/// Run until MQTT fails for good.
pub async fn run<C: MqttClient>(bridge: &mut Bridge<C>) -> Result<(), MqttError> {
    bridge.connect().await?;
    loop {
        run_once(bridge).await?;
    }
}
