//! Cancellable periodic background task.

use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, select, tick, Sender};
use log::{debug, error};

use crate::error::Result;

struct Running {
    stop_tx: Sender<()>,
    handle: JoinHandle<()>,
}

/// Runs a closure on its own thread at a fixed interval until stopped.
pub struct PeriodicTask {
    name: String,
    running: Option<Running>,
}

impl PeriodicTask {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            running: None,
        }
    }

    /// Start ticking. A no-op if the task is already running.
    pub fn start<F>(&mut self, interval: Duration, mut f: F) -> Result<()>
    where
        F: FnMut() + Send + 'static,
    {
        if self.is_running() {
            return Ok(());
        }
        // Reap a thread that exited on its own
        self.stop();

        let (stop_tx, stop_rx) = bounded::<()>(1);
        let ticker = tick(interval);
        let handle = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || loop {
                select! {
                    recv(stop_rx) -> _ => break,
                    recv(ticker) -> _ => f(),
                }
            })?;

        debug!("Started {} (every {:?})", self.name, interval);
        self.running = Some(Running { stop_tx, handle });
        Ok(())
    }

    /// Stop the task and wait for its thread. A no-op if not running.
    ///
    /// Called from the task's own thread, the join is skipped and the loop
    /// exits once the current tick returns.
    pub fn stop(&mut self) {
        let Some(Running { stop_tx, handle }) = self.running.take() else {
            return;
        };
        // Disconnecting the channel also wakes the select
        let _ = stop_tx.try_send(());
        drop(stop_tx);

        if handle.thread().id() == thread::current().id() {
            return;
        }
        if handle.join().is_err() {
            error!("{} thread panicked", self.name);
        }
        debug!("Stopped {}", self.name);
    }

    pub fn is_running(&self) -> bool {
        self.running
            .as_ref()
            .is_some_and(|r| !r.handle.is_finished())
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.stop();
    }
}
