//! Execution contexts: where a callable runs and how the caller waits for it.

use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use log::{debug, error};

use crate::errors::{RuntimeError, RuntimeResult};

/// Unit of work submitted to a context.
pub type Job = Box<dyn FnOnce() -> RuntimeResult<()> + Send + 'static>;

/// A place to run work, with a barrier that waits for everything submitted.
pub trait ExecutionContext {
    fn name(&self) -> &str;

    /// Submits `job`. Asynchronous contexts return before it has run.
    fn launch(&self, job: Job) -> RuntimeResult<()>;

    /// Blocks until every launched job finished and reports the first job
    /// error raised since the previous barrier.
    fn synchronize(&self) -> RuntimeResult<()>;
}

/// Runs jobs inline on the calling thread; the barrier is a no-op.
#[derive(Debug, Clone, Default)]
pub struct HostContext;

impl ExecutionContext for HostContext {
    fn name(&self) -> &str {
        "host"
    }

    fn launch(&self, job: Job) -> RuntimeResult<()> {
        job()
    }

    fn synchronize(&self) -> RuntimeResult<()> {
        Ok(())
    }
}

#[derive(Default)]
struct StreamState {
    pending: usize,
    error: Option<RuntimeError>,
}

#[derive(Default)]
struct StreamShared {
    state: Mutex<StreamState>,
    drained: Condvar,
}

impl StreamShared {
    fn lock(&self) -> MutexGuard<'_, StreamState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Emulated accelerator stream.
///
/// Jobs are queued to a single worker thread and run in submission order, so
/// `launch` returns as soon as the job is enqueued and only `synchronize`
/// observes completion.
pub struct DeviceContext {
    name: String,
    sender: Option<Sender<Job>>,
    shared: Arc<StreamShared>,
    handle: Option<JoinHandle<()>>,
}

impl DeviceContext {
    pub fn new(name: &str) -> RuntimeResult<Self> {
        let (sender, receiver) = mpsc::channel::<Job>();
        let shared = Arc::new(StreamShared::default());
        let worker_shared = Arc::clone(&shared);
        let context = name.to_string();

        let handle = thread::Builder::new()
            .name(format!("{}-stream", name))
            .spawn(move || {
                for job in receiver {
                    let outcome = panic::catch_unwind(AssertUnwindSafe(job));
                    let mut state = worker_shared.lock();
                    let failure = match outcome {
                        Ok(Ok(())) => None,
                        Ok(Err(e)) => Some(e),
                        Err(_) => Some(RuntimeError::JobPanicked {
                            context: context.clone(),
                        }),
                    };
                    if let Some(e) = failure {
                        error!("Job failed on the '{}' stream: {}", context, e);
                        if state.error.is_none() {
                            state.error = Some(e);
                        }
                    }
                    state.pending -= 1;
                    if state.pending == 0 {
                        worker_shared.drained.notify_all();
                    }
                }
            })
            .map_err(|source| RuntimeError::StreamSpawn {
                context: name.to_string(),
                source,
            })?;
        debug!("Started device stream '{}'", name);

        Ok(Self {
            name: name.to_string(),
            sender: Some(sender),
            shared,
            handle: Some(handle),
        })
    }

    /// Jobs launched but not yet finished.
    pub fn pending(&self) -> usize {
        self.shared.lock().pending
    }
}

impl ExecutionContext for DeviceContext {
    fn name(&self) -> &str {
        &self.name
    }

    fn launch(&self, job: Job) -> RuntimeResult<()> {
        let sender = self.sender.as_ref().ok_or(RuntimeError::StreamClosed)?;
        self.shared.lock().pending += 1;
        if sender.send(job).is_err() {
            self.shared.lock().pending -= 1;
            return Err(RuntimeError::StreamClosed);
        }
        Ok(())
    }

    fn synchronize(&self) -> RuntimeResult<()> {
        let mut state = self.shared.lock();
        while state.pending > 0 {
            state = self
                .shared
                .drained
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        match state.error.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        // Closing the channel ends the worker loop once the queue is drained.
        self.sender.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
