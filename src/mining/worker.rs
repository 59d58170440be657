use crate::core::{Block, CancelToken, MiningOutcome, ProofOfWork};
use crate::error::{LedgerError, Result};
use log::{debug, info, warn};
use std::sync::mpsc::{self, Sender};
use std::thread::{self, JoinHandle};

/// One nonce search the worker should run.
#[derive(Debug, Clone)]
pub struct MiningJob {
    pub job_id: u64,
    /// Unmined block on top of the tip the job was created for.
    pub template: Block,
    pub cancel: CancelToken,
}

/// Something that can run mining jobs in the background and report back.
/// The sync manager only talks to this seam, so tests can swap in a miner
/// that never hashes.
pub trait MiningBackend: Send {
    fn submit(&mut self, job: MiningJob) -> Result<()>;

    /// Cancels whatever is running and stops accepting jobs.
    fn shutdown(&mut self);
}

/// Dedicated mining thread fed through a job channel.
pub struct MiningWorker {
    jobs: Option<Sender<MiningJob>>,
    handle: Option<JoinHandle<()>>,
    last_cancel: Option<CancelToken>,
}

impl MiningWorker {
    /// Starts the worker thread. `on_result` is called with every finished
    /// job; returning false stops the worker.
    pub fn spawn<F>(mut on_result: F) -> Result<MiningWorker>
    where
        F: FnMut(u64, MiningOutcome) -> bool + Send + 'static,
    {
        let (jobs, queue) = mpsc::channel::<MiningJob>();
        let handle = thread::Builder::new()
            .name("miner".to_string())
            .spawn(move || {
                for job in queue {
                    if job.cancel.is_cancelled() {
                        if !on_result(job.job_id, MiningOutcome::Cancelled) {
                            break;
                        }
                        continue;
                    }

                    let start_nonce = rand::random::<u64>();
                    info!(
                        "Mining block {} with {} records (difficulty {})",
                        job.template.get_index(),
                        job.template.get_records().len(),
                        job.template.get_difficulty()
                    );
                    let outcome =
                        ProofOfWork::new_proof_of_work(job.template).run(start_nonce, &job.cancel);
                    if !on_result(job.job_id, outcome) {
                        break;
                    }
                }
                debug!("Mining worker stopped");
            })
            .map_err(|e| LedgerError::Io(format!("Failed to spawn mining thread: {e}")))?;

        Ok(MiningWorker {
            jobs: Some(jobs),
            handle: Some(handle),
            last_cancel: None,
        })
    }
}

impl MiningBackend for MiningWorker {
    fn submit(&mut self, job: MiningJob) -> Result<()> {
        let jobs = self
            .jobs
            .as_ref()
            .ok_or_else(|| LedgerError::Io("Mining worker is shut down".to_string()))?;
        self.last_cancel = Some(job.cancel.clone());
        jobs.send(job)
            .map_err(|_| LedgerError::Io("Mining worker thread has exited".to_string()))
    }

    fn shutdown(&mut self) {
        if let Some(cancel) = self.last_cancel.take() {
            cancel.cancel();
        }
        // closing the channel ends the worker loop
        self.jobs.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Mining thread panicked");
            }
        }
    }
}

impl Drop for MiningWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}
