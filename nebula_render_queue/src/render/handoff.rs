/// RenderWorker - dedicated execution thread behind a bounded channel
///
/// The recording thread hands each frame's step log to this worker and
/// immediately goes back to recording. The channel holds at most one
/// pending frame, so a slow executor stalls the recording thread here
/// rather than letting it run arbitrarily far ahead. Execution errors are
/// parked in a slot the recording thread drains at its next frame start.

use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crate::error::{Error, Result};
use crate::{nebula_debug, nebula_error};

use super::executor::FrameExecutor;
use super::step::Step;

const LOG_SOURCE: &str = "nebula::queue";

enum WorkOrder {
    RunFrame { frame_index: u64, steps: Vec<Step> },
    RecreateSurface { reply: mpsc::Sender<Result<()>> },
}

/// Handle to the render thread, owned by the queue facade
pub struct RenderWorker {
    sender: Option<SyncSender<WorkOrder>>,
    join: Option<JoinHandle<()>>,
    error_slot: Arc<Mutex<Option<Error>>>,
}

impl RenderWorker {
    /// Moves the executor onto a named thread and starts the work loop.
    ///
    /// # Errors
    ///
    /// Returns `InitializationFailed` if the OS refuses the thread.
    pub fn spawn(executor: FrameExecutor) -> Result<Self> {
        let (sender, receiver) = mpsc::sync_channel::<WorkOrder>(1);
        let error_slot = Arc::new(Mutex::new(None));
        let parked = Arc::clone(&error_slot);
        let join = std::thread::Builder::new()
            .name("nebula-render".to_string())
            .spawn(move || worker_loop(executor, receiver, parked))
            .map_err(|err| {
                Error::InitializationFailed(format!("failed to spawn render thread: {}", err))
            })?;
        Ok(Self {
            sender: Some(sender),
            join: Some(join),
            error_slot,
        })
    }

    /// Queues one frame for execution, blocking while the previous handoff
    /// is still unclaimed.
    ///
    /// # Errors
    ///
    /// Returns `BackendError` when the render thread has exited.
    pub fn submit(&self, frame_index: u64, steps: Vec<Step>) -> Result<()> {
        self.send(WorkOrder::RunFrame { frame_index, steps })
    }

    /// Runs a surface rebuild on the render thread and waits for it.
    ///
    /// # Errors
    ///
    /// Propagates the rebuild result, or `BackendError` when the render
    /// thread has exited.
    pub fn recreate_surface(&self) -> Result<()> {
        let (reply, response) = mpsc::channel();
        self.send(WorkOrder::RecreateSurface { reply })?;
        response
            .recv()
            .map_err(|_| Error::BackendError("render thread is gone".to_string()))?
    }

    /// Takes the most recent execution error, if one was parked
    pub fn take_error(&self) -> Option<Error> {
        self.error_slot.lock().unwrap().take()
    }

    /// Closes the channel and joins the thread; safe to call twice.
    ///
    /// # Errors
    ///
    /// Returns `BackendError` if the render thread panicked.
    pub fn shutdown(&mut self) -> Result<()> {
        drop(self.sender.take());
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| Error::BackendError("render thread panicked".to_string()))?;
        }
        Ok(())
    }

    fn send(&self, order: WorkOrder) -> Result<()> {
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| Error::BackendError("render thread is shut down".to_string()))?;
        sender
            .send(order)
            .map_err(|_| Error::BackendError("render thread is gone".to_string()))
    }
}

impl Drop for RenderWorker {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            nebula_error!(LOG_SOURCE, "render thread shutdown failed: {}", err);
        }
    }
}

fn worker_loop(
    mut executor: FrameExecutor,
    receiver: Receiver<WorkOrder>,
    error_slot: Arc<Mutex<Option<Error>>>,
) {
    nebula_debug!(LOG_SOURCE, "render thread started");
    while let Ok(order) = receiver.recv() {
        match order {
            WorkOrder::RunFrame { frame_index, steps } => {
                if let Err(err) = executor.run_frame(frame_index, steps) {
                    nebula_error!(
                        LOG_SOURCE,
                        "frame {} failed on the render thread: {}",
                        frame_index,
                        err
                    );
                    if let Ok(mut slot) = error_slot.lock() {
                        *slot = Some(err);
                    }
                }
            }
            WorkOrder::RecreateSurface { reply } => {
                let _ = reply.send(executor.recreate_surface());
            }
        }
    }
    nebula_debug!(LOG_SOURCE, "render thread exited");
}

#[cfg(test)]
#[path = "handoff_tests.rs"]
mod tests;
