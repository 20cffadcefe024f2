//! Worker pool that runs dispatch loops concurrently.
//!
//! Each request's offer loop blocks on captain replies, so requests are dispatched on a
//! fixed set of threads fed by a crossbeam job queue.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{unbounded, Receiver, Sender};
use tracing::{debug, info};

use crate::error::{DispatchError, Result};
use crate::model::RequestId;
use crate::orchestrator::{DispatchOutcome, Dispatcher};

/// Result of dispatching one request on a worker.
#[derive(Debug)]
pub struct WorkerReport {
    pub request_id: RequestId,
    pub result: Result<DispatchOutcome>,
}

pub struct DispatchWorkers {
    jobs: Option<Sender<RequestId>>,
    reports: Receiver<WorkerReport>,
    handles: Vec<JoinHandle<()>>,
}

impl DispatchWorkers {
    /// Start `workers` threads dispatching against `dispatcher`.
    pub fn start(dispatcher: Arc<Dispatcher>, workers: usize) -> Result<Self> {
        if workers == 0 {
            return Err(DispatchError::invalid("worker count must be positive"));
        }
        let (job_tx, job_rx) = unbounded::<RequestId>();
        let (report_tx, report_rx) = unbounded();

        let mut handles = Vec::with_capacity(workers);
        for index in 0..workers {
            let dispatcher = Arc::clone(&dispatcher);
            let jobs = job_rx.clone();
            let reports = report_tx.clone();
            let handle = thread::Builder::new()
                .name(format!("dispatch-worker-{index}"))
                .spawn(move || {
                    for request_id in jobs.iter() {
                        debug!(worker = index, request_id = %request_id, "dispatching");
                        let result = dispatcher.dispatch(request_id);
                        if reports.send(WorkerReport { request_id, result }).is_err() {
                            break;
                        }
                    }
                })
                .map_err(|err| DispatchError::invalid(format!("spawn worker: {err}")))?;
            handles.push(handle);
        }
        info!(workers, "dispatch workers started");

        Ok(Self {
            jobs: Some(job_tx),
            reports: report_rx,
            handles,
        })
    }

    /// Queue a request for dispatch.
    pub fn submit(&self, request_id: RequestId) -> Result<()> {
        self.jobs
            .as_ref()
            .ok_or_else(|| DispatchError::invalid("workers are shut down"))?
            .send(request_id)
            .map_err(|_| DispatchError::invalid("worker queue closed"))
    }

    /// Completed reports, in completion order.
    pub fn results(&self) -> &Receiver<WorkerReport> {
        &self.reports
    }

    /// Stop accepting jobs, finish queued ones and return every report not yet read.
    pub fn shutdown(mut self) -> Vec<WorkerReport> {
        self.jobs.take();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
        self.reports.try_iter().collect()
    }
}

impl Drop for DispatchWorkers {
    fn drop(&mut self) {
        self.jobs.take();
    }
}
