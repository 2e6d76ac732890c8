use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::controller::Controller;
use crate::miio::PurifierDevice;
use crate::mqtt::RequestData;
use crate::notify::Notify;
use crate::sensor;

/// Minimum spacing between processed reports, and the delay before asking the
/// monitor for the next one.
pub const PROCESS_INTERVAL: Duration = Duration::from_secs(60);

/// Drops events that arrive within `interval` of the last processed one.
#[derive(Debug)]
pub struct Debouncer {
    interval: Duration,
    last: Option<Instant>,
}

impl Debouncer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    pub fn ready(&self, now: Instant) -> bool {
        self.last
            .is_none_or(|last| now.saturating_duration_since(last) >= self.interval)
    }

    pub fn mark(&mut self, now: Instant) {
        self.last = Some(now);
    }
}

/// Turns inbound sensor reports into decision cycles.
///
/// Owns everything the message flow mutates: the debounce state, the
/// controller (and with it the device handle), and the pending re-request
/// timer. The timer task only signals the MQTT task.
pub struct EventHandler<D, N> {
    controller: Controller<D, N>,
    debounce: Debouncer,
    request_tx: mpsc::Sender<RequestData>,
    pending_request: Option<JoinHandle<()>>,
}

impl<D: PurifierDevice, N: Notify> EventHandler<D, N> {
    pub fn new(controller: Controller<D, N>, request_tx: mpsc::Sender<RequestData>) -> Self {
        Self {
            controller,
            debounce: Debouncer::new(PROCESS_INTERVAL),
            request_tx,
            pending_request: None,
        }
    }

    /// Handle one inbound payload. Returns whether it ran a decision cycle.
    pub async fn handle(&mut self, payload: &[u8]) -> bool {
        let now = Instant::now();
        if !self.debounce.ready(now) {
            trace!("Dropping report inside debounce window");
            return false;
        }

        let report = match sensor::parse_report(payload) {
            Ok(Some(report)) => report,
            Ok(None) => {
                debug!("Message has no body, ignoring");
                return false;
            }
            Err(e) => {
                warn!("Failed to parse sensor report: {}", e);
                return false;
            }
        };

        report.log();
        self.debounce.mark(now);
        self.controller.decide(report.co2, report.pm25).await;
        self.schedule_request();
        true
    }

    /// Ask the monitor for fresh data once the debounce window has passed.
    fn schedule_request(&mut self) {
        if let Some(pending) = self.pending_request.take() {
            pending.abort();
        }
        let tx = self.request_tx.clone();
        let delay = self.debounce.interval;
        self.pending_request = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if tx.send(RequestData).await.is_err() {
                warn!("Data request channel closed");
            }
        }));
    }

    /// Cancel the pending re-request, if any.
    pub fn shutdown(&mut self) {
        if let Some(pending) = self.pending_request.take() {
            pending.abort();
        }
    }
}
