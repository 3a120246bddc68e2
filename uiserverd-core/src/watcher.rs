//! Long-running watch on gpg-agent's smartcard device notifications.
//!
//! Keeps a "SCD DEVINFO --watch" command open on the agent and forwards
//! DEVINFO_STATUS lines as events. Connect failures back off
//! exponentially from the initial delay up to the cap; after the
//! configured number of consecutive failures the watcher gives up for
//! good. A broken pipe inside a running watch reconnects immediately
//! and does not count as a failure.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, info, trace, warn};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::config::WatcherConfig;
use crate::engine::{AgentTransport, AgentWatch, TransportError, WatchStep};

const WATCH_COMMAND: &str = "SCD DEVINFO --watch";
const STATUS_KEYWORD: &str = "DEVINFO_STATUS";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatcherEvent {
    /// A DEVINFO_STATUS line arrived from the agent.
    Status { payload: String },
    /// The agent looks down; emitted once per failure streak so the
    /// server can try to launch it.
    AgentStartRequested,
}

pub struct DeviceInfoWatcher {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

struct Shared {
    shutdown: AtomicBool,
    notify: Notify,
    initial_delay: Duration,
    max_delay: Duration,
    max_attempts: u32,
    restart_pause: Duration,
}

impl DeviceInfoWatcher {
    /// Spawns the watch worker and hands back the event stream.
    pub fn start(
        config: &WatcherConfig,
        transport: Arc<dyn AgentTransport>,
    ) -> (DeviceInfoWatcher, UnboundedReceiver<WatcherEvent>) {
        let shared = Arc::new(Shared {
            shutdown: AtomicBool::new(false),
            notify: Notify::new(),
            initial_delay: Duration::from_millis(config.initial_retry_delay_ms),
            max_delay: Duration::from_millis(config.max_retry_delay_ms),
            max_attempts: config.max_connect_attempts,
            restart_pause: Duration::from_millis(config.restart_pause_ms),
        });
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(worker_loop(
            Arc::clone(&shared),
            transport,
            tx,
        ));
        (
            DeviceInfoWatcher {
                shared,
                worker: Mutex::new(Some(worker)),
            },
            rx,
        )
    }

    pub fn is_running(&self) -> bool {
        self.worker
            .lock()
            .unwrap()
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    /// Stops the worker and waits for it to wind down.
    pub async fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        self.shared.notify.notify_one();
        let handle = self.worker.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

impl Shared {
    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Sleeps unless shutdown comes first. Returns false on shutdown.
    async fn pause(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => !self.is_shutdown(),
            _ = self.notify.notified() => false,
        }
    }
}

/// Retry delay after `failures` consecutive connect failures, doubling
/// from the initial delay up to the cap.
fn backoff_delay(initial: Duration, max: Duration, failures: u32) -> Duration {
    let shift = failures.saturating_sub(1).min(16);
    initial.saturating_mul(1 << shift).min(max)
}

async fn worker_loop(
    shared: Arc<Shared>,
    transport: Arc<dyn AgentTransport>,
    events: UnboundedSender<WatcherEvent>,
) {
    let mut failures: u32 = 0;
    loop {
        if shared.is_shutdown() {
            return;
        }
        let mut watch = match transport.connect().await {
            Ok(watch) => watch,
            Err(err) => {
                if failures == 0 {
                    debug!("watcher: agent not reachable, requesting a start");
                    let _ = events.send(WatcherEvent::AgentStartRequested);
                }
                failures += 1;
                if failures >= shared.max_attempts {
                    warn!(
                        "watcher: no connection to gpg-agent after {failures} attempt(s), giving up: {err}"
                    );
                    return;
                }
                let delay = backoff_delay(shared.initial_delay, shared.max_delay, failures);
                debug!(
                    "watcher: connect failed ({err}), retrying in {}ms",
                    delay.as_millis()
                );
                if !shared.pause(delay).await {
                    return;
                }
                continue;
            }
        };
        failures = 0;

        if let Err(err) = watch.start(WATCH_COMMAND).await {
            match err {
                TransportError::BrokenPipe => {
                    debug!("watcher: agent hung up while starting the watch, reconnecting");
                    continue;
                }
                err => {
                    warn!("watcher: cannot start device watch: {err}");
                    return;
                }
            }
        }
        debug!("watcher: device watch running");

        match run_watch(&shared, watch.as_mut(), &events).await {
            WatchOutcome::Shutdown => return,
            WatchOutcome::BrokenPipe => {
                debug!("watcher: agent hung up, reconnecting");
            }
            WatchOutcome::Finished => {
                if !shared.pause(shared.restart_pause).await {
                    return;
                }
            }
            WatchOutcome::Fatal => return,
        }
    }
}

enum WatchOutcome {
    Finished,
    BrokenPipe,
    Fatal,
    Shutdown,
}

async fn run_watch(
    shared: &Shared,
    watch: &mut dyn AgentWatch,
    events: &UnboundedSender<WatcherEvent>,
) -> WatchOutcome {
    loop {
        tokio::select! {
            _ = shared.notify.notified() => {
                watch.cancel().await;
                return WatchOutcome::Shutdown;
            }
            step = watch.next() => match step {
                Ok(WatchStep::Status { keyword, payload }) => {
                    if keyword == STATUS_KEYWORD {
                        let _ = events.send(WatcherEvent::Status { payload });
                    } else {
                        trace!("watcher: ignoring status {keyword}");
                    }
                }
                Ok(WatchStep::Finished { code, description }) => {
                    info!("watcher: device watch ended ({code} {description}), restarting");
                    return WatchOutcome::Finished;
                }
                Err(TransportError::BrokenPipe) => return WatchOutcome::BrokenPipe,
                Err(err) => {
                    warn!("watcher: device watch failed: {err}, stopping");
                    return WatchOutcome::Fatal;
                }
            }
        }
    }
}
