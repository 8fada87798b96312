//! Background flush and merge worker

use super::harness::LsmHarness;
use super::tracker::BackgroundTask;
use crossbeam_channel::{Receiver, Sender};
use std::sync::Weak;
use std::thread;
use strata_common::{Error, Result};
use tracing::{debug, error, info};

#[derive(Debug)]
enum Message {
    Run(BackgroundTask),
    Shutdown,
}

/// One worker thread per index, fed through a channel. The worker only
/// holds a weak reference so it never keeps a dropped index alive.
#[derive(Debug)]
pub(crate) struct Scheduler {
    sender: Sender<Message>,
    handle: Option<thread::JoinHandle<()>>,
}

impl Scheduler {
    pub fn start(harness: Weak<LsmHarness>, name: &str) -> Result<Self> {
        let (sender, receiver) = crossbeam_channel::unbounded();
        let handle = thread::Builder::new()
            .name(format!("strata-io-{name}"))
            .spawn(move || worker(&harness, &receiver))
            .map_err(|e| Error::internal(format!("failed to spawn background worker: {e}")))?;
        Ok(Self {
            sender,
            handle: Some(handle),
        })
    }

    /// Queue a task; false if the worker is gone
    pub fn schedule(&self, task: BackgroundTask) -> bool {
        self.sender.send(Message::Run(task)).is_ok()
    }

    /// Stop the worker after the task it is running, dropping queued ones
    pub fn shutdown(mut self) {
        let _ = self.sender.send(Message::Shutdown);
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            error!("background worker panicked");
        }
    }
}

fn worker(harness: &Weak<LsmHarness>, receiver: &Receiver<Message>) {
    info!("background worker started");
    for message in receiver {
        let task = match message {
            Message::Run(task) => task,
            Message::Shutdown => break,
        };
        let Some(harness) = harness.upgrade() else {
            break;
        };
        if harness.is_shut_down() {
            debug!(%task, "skipping task after shutdown");
            continue;
        }
        harness.run_task(task);
    }
    info!("background worker stopped");
}
