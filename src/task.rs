use std::future::Future;
use tokio::task::JoinHandle;

/// Connection generation a background task was started under
pub type Epoch = u64;

/// Handle to a background task tied to one connection epoch
#[derive(Debug)]
pub(crate) struct EpochTask {
    name: &'static str,
    epoch: Epoch,
    handle: JoinHandle<()>,
}

impl EpochTask {
    pub fn spawn<F>(name: &'static str, epoch: Epoch, future: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        tracing::debug!("Starting {} task (epoch {})", name, epoch);
        Self {
            name,
            epoch,
            handle: tokio::spawn(future),
        }
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Abort the task and wait for it to wind down
    ///
    /// The cancellation error is swallowed; a panic inside the task is logged.
    pub async fn cancel(self) {
        self.handle.abort();
        match self.handle.await {
            Ok(()) => {}
            Err(e) if e.is_cancelled() => {}
            Err(e) => tracing::error!("{} task failed: {}", self.name, e),
        }
        tracing::debug!("Cancelled {} task (epoch {})", self.name, self.epoch);
    }
}

/// Slot holding at most one task of a kind
#[derive(Debug, Default)]
pub(crate) struct TaskSlot {
    task: std::sync::Mutex<Option<EpochTask>>,
}

impl TaskSlot {
    /// Store a task, returning the one it replaced
    pub fn replace(&self, task: EpochTask) -> Option<EpochTask> {
        self.lock().replace(task)
    }

    /// True while a task started under `epoch` is stored and still running
    pub fn is_running_for(&self, epoch: Epoch) -> bool {
        self.lock()
            .as_ref()
            .is_some_and(|task| task.epoch() == epoch && !task.is_finished())
    }

    /// Take the task out if it belongs to `epoch`
    ///
    /// A task from another epoch is left in place.
    pub fn take_for(&self, epoch: Epoch) -> Option<EpochTask> {
        let mut slot = self.lock();
        if slot.as_ref().is_some_and(|task| task.epoch() == epoch) {
            slot.take()
        } else {
            None
        }
    }

    /// Take the task out regardless of epoch
    pub fn take(&self) -> Option<EpochTask> {
        self.lock().take()
    }

    /// Cancel the stored task if it belongs to `epoch`
    pub async fn cancel_for(&self, epoch: Epoch) {
        if let Some(task) = self.take_for(epoch) {
            task.cancel().await;
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<EpochTask>> {
        self.task.lock().unwrap()
    }
}

impl Drop for TaskSlot {
    fn drop(&mut self) {
        if let Some(task) = self.lock().take() {
            task.handle.abort();
        }
    }
}
