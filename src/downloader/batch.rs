//! Batch scheduling: a bounded worker pool with staggered starts. Jobs are
//! isolated; a crash inside one worker becomes a failed result for that
//! job and never takes down its siblings.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{FuturesUnordered, StreamExt};
use log::{error, info};
use tokio::sync::Semaphore;

use crate::downloader::{BatchOptions, BatchResult, DownloadJob, JobResult, JobRunner, JobStatus};
use crate::progress::{ProgressEvent, ProgressSender};

pub async fn run_batch(
    runner: Arc<dyn JobRunner>,
    jobs: Vec<DownloadJob>,
    options: &BatchOptions,
    events: &ProgressSender,
) -> BatchResult {
    let started = Instant::now();
    let total = jobs.len();
    if total == 0 {
        return BatchResult {
            total: 0,
            success: 0,
            failed: 0,
            results: Vec::new(),
            duration_seconds: 0.0,
        };
    }

    let workers = options.worker_count();
    info!(
        "Starting batch: {} job(s), {} worker(s), {} mode",
        total,
        workers,
        if options.parallel { "parallel" } else { "serial" }
    );

    let semaphore = Arc::new(Semaphore::new(workers));
    let mut running = FuturesUnordered::new();

    for (index, job) in jobs.into_iter().enumerate() {
        events.emit(ProgressEvent::for_job(&job, JobStatus::Queued));

        let runner = Arc::clone(&runner);
        let semaphore = Arc::clone(&semaphore);
        let events = events.clone();
        let fallback = job.clone();
        let delay = if options.parallel {
            options.stagger * index as u32
        } else {
            Duration::ZERO
        };

        let handle = tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let _permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return JobResult::failed(&job, "scheduler shut down", 0.0),
            };
            runner.run(job, &events).await
        });

        running.push(async move {
            match handle.await {
                Ok(result) => result,
                Err(e) => {
                    error!("Worker for job {} crashed: {}", fallback.id, e);
                    JobResult::failed(&fallback, format!("worker crashed: {}", e), 0.0)
                }
            }
        });
    }

    let mut results = Vec::with_capacity(total);
    let mut success = 0;
    let mut failed = 0;
    while let Some(result) = running.next().await {
        if result.success {
            success += 1;
        } else {
            failed += 1;
        }
        results.push(result);
    }

    let duration_seconds = started.elapsed().as_secs_f64();
    info!(
        "Batch finished: {}/{} succeeded, {} failed in {:.1}s",
        success, total, failed, duration_seconds
    );

    BatchResult {
        total,
        success,
        failed,
        results,
        duration_seconds,
    }
}
