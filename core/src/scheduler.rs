// core/src/scheduler.rs
//
// Periodic poll timer for the tunnel engine.
// Sends poll requests into the engine inbox on a fixed interval; manual
// pokes go through the same inbox without touching the timer.

use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, Local};
use log::{debug, info, warn};

use crate::engine::{EngineInput, PollReason};

struct Timer {
    interval: Duration,
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

/// Drives poll cycles. At most one timer thread runs at any time.
pub struct PollScheduler {
    inbox: Sender<EngineInput>,
    timer: Option<Timer>,
}

impl PollScheduler {
    pub fn new(inbox: Sender<EngineInput>) -> Self {
        Self { inbox, timer: None }
    }

    /// Start firing every `interval`. Does nothing if already running.
    pub fn start(&mut self, interval: Duration) {
        if self.timer.is_some() {
            warn!("Poll scheduler is already running");
            return;
        }

        let (stop, stopped) = mpsc::channel::<()>();
        let inbox = self.inbox.clone();

        let handle = thread::spawn(move || {
            info!("Poll timer started ({}s)", interval.as_secs());
            loop {
                match stopped.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        if inbox.send(EngineInput::Poll(PollReason::Timer)).is_err() {
                            debug!("Engine inbox closed; stopping poll timer");
                            break;
                        }
                    }
                    // Explicit stop, or the scheduler was dropped.
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            info!("Poll timer stopped");
        });

        self.timer = Some(Timer {
            interval,
            stop,
            handle,
        });
    }

    /// Replace the running timer with one at `interval`. The old timer has
    /// fully stopped before the new one starts.
    pub fn restart(&mut self, interval: Duration) {
        info!("Restarting poll timer with {}s interval", interval.as_secs());
        self.stop();
        self.start(interval);
    }

    pub fn stop(&mut self) {
        if let Some(timer) = self.timer.take() {
            let _ = timer.stop.send(());
            if timer.handle.join().is_err() {
                warn!("Poll timer thread panicked");
            }
        }
    }

    /// Request an immediate poll without disturbing the timer.
    pub fn poke(&self) {
        if self.inbox.send(EngineInput::Poll(PollReason::Poke)).is_err() {
            debug!("Engine inbox closed; poke dropped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.timer.is_some()
    }

    pub fn interval(&self) -> Option<Duration> {
        self.timer.as_ref().map(|t| t.interval)
    }
}

impl Drop for PollScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Format the last poll time for display.
pub fn format_last_poll(last_poll: &Option<DateTime<Local>>) -> String {
    match last_poll {
        Some(dt) if dt.date_naive() == Local::now().date_naive() => {
            format!("Last checked: {}", dt.format("%H:%M:%S"))
        }
        Some(dt) => format!("Last checked: {}", dt.format("%b %-d, %H:%M:%S")),
        None => "Last checked: never".to_string(),
    }
}
