use std::{
    io,
    panic::{AssertUnwindSafe, catch_unwind},
    thread::{self, JoinHandle},
    time::Duration,
};

use parking_lot::Mutex;
use tokio::{
    select,
    sync::mpsc,
    time::{Instant, sleep_until},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

pub(crate) type Job = Box<dyn FnOnce() + Send>;

struct Queued {
    job: Job,
    due: Instant,
}

/// Runs callbacks one at a time, in submission order, on a dedicated thread
pub(crate) struct Dispatcher {
    jobs: mpsc::UnboundedSender<Queued>,
    cancel: CancellationToken,
    latency: Duration,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
    pub fn start(latency: Duration) -> io::Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()?;
        let (jobs, jobs_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let inner_cancel = cancel.clone();
        let thread = thread::Builder::new()
            .name("loopback-dispatch".to_string())
            .spawn(move || runtime.block_on(dispatch_lifecycle(jobs_rx, inner_cancel)))?;
        Ok(Dispatcher {
            jobs,
            cancel,
            latency,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Queue a job. Returns `false` if the dispatcher has stopped.
    pub fn submit(&self, job: Job) -> bool {
        let due = Instant::now() + self.latency;
        if self.jobs.send(Queued { job, due }).is_err() {
            trace!("Dispatcher stopped, dropping job");
            return false;
        }
        true
    }

    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    /// Stop the dispatch thread. Queued jobs that have not run are dropped.
    pub fn stop(&self) {
        self.cancel.cancel();
        let Some(thread) = self.thread.lock().take() else {
            return;
        };
        // A job can hold the last reference to us
        if thread.thread().id() == thread::current().id() {
            return;
        }
        if thread.join().is_err() {
            warn!("Loopback dispatch thread panicked");
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn dispatch_lifecycle(mut jobs: mpsc::UnboundedReceiver<Queued>, cancel: CancellationToken) {
    debug!("Loopback dispatcher started");
    loop {
        let queued = select! {
            _ = cancel.cancelled() => break,
            queued = jobs.recv() => match queued {
                Some(queued) => queued,
                None => break,
            },
        };
        select! {
            _ = cancel.cancelled() => break,
            _ = sleep_until(queued.due) => (),
        }
        if catch_unwind(AssertUnwindSafe(queued.job)).is_err() {
            warn!("Unhandled panic in loopback callback");
        }
    }
    debug!("Loopback dispatcher stopped");
}
