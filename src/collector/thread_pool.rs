use std::{sync::Arc, thread::JoinHandle};

use crossbeam::{
    channel::{unbounded, Sender},
    sync::WaitGroup,
};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Helper threads of the collector. The thread calling [`run`](Self::run) takes part as
/// worker 0, so a pool of `n` helpers runs up to `n + 1` workers.
pub(crate) struct GCThreadPool {
    sender: Option<Sender<Job>>,
    threads: Vec<JoinHandle<()>>,
}

impl GCThreadPool {
    pub fn new(helpers: usize) -> Self {
        let (sender, receiver) = unbounded::<Job>();
        let mut threads = Vec::with_capacity(helpers);
        for i in 0..helpers {
            let receiver = receiver.clone();
            let spawned = std::thread::Builder::new()
                .name(format!("strata-gc-worker-{}", i))
                .spawn(move || {
                    while let Ok(job) = receiver.recv() {
                        job();
                    }
                });
            match spawned {
                Ok(handle) => threads.push(handle),
                Err(err) => {
                    log::warn!("failed to spawn gc worker {}: {}", i, err);
                    break;
                }
            }
        }
        log::debug!("gc thread pool started with {} helpers", threads.len());
        Self {
            sender: Some(sender),
            threads,
        }
    }

    /// Workers available to one job, the calling thread included.
    pub fn size(&self) -> usize {
        self.threads.len() + 1
    }

    /// Runs `job(worker_id)` on up to `workers` threads and waits for all of them. Returns
    /// the number of workers that took part.
    pub fn run(&self, workers: usize, job: Arc<dyn Fn(usize) + Send + Sync>) -> usize {
        self.run_with(workers, job, |_| {})
    }

    /// Like [`run`](Self::run), but hands the number of dispatched workers to `dispatched`
    /// before the calling thread starts its own share.
    pub fn run_with(
        &self,
        workers: usize,
        job: Arc<dyn Fn(usize) + Send + Sync>,
        dispatched: impl FnOnce(usize),
    ) -> usize {
        let workers = workers.clamp(1, self.size());
        let wait_group = WaitGroup::new();
        let mut count = 1;
        if let Some(sender) = &self.sender {
            for id in 1..workers {
                let job = job.clone();
                let wait_group = wait_group.clone();
                let task: Job = Box::new(move || {
                    job(id);
                    drop(wait_group);
                });
                if sender.send(task).is_err() {
                    log::warn!("gc helpers are gone, running with {} workers", count);
                    break;
                }
                count += 1;
            }
        }
        dispatched(count);
        job(0);
        wait_group.wait();
        count
    }
}

impl Drop for GCThreadPool {
    fn drop(&mut self) {
        drop(self.sender.take());
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn run_uses_every_worker_id_once() {
        let pool = GCThreadPool::new(3);
        assert_eq!(pool.size(), 4);
        let seen = Arc::new(AtomicUsize::new(0));
        let calls = Arc::new(AtomicUsize::new(0));
        {
            let seen = seen.clone();
            let calls = calls.clone();
            pool.run(
                4,
                Arc::new(move |id| {
                    seen.fetch_or(1 << id, Ordering::AcqRel);
                    calls.fetch_add(1, Ordering::AcqRel);
                }),
            );
        }
        assert_eq!(seen.load(Ordering::Acquire), 0b1111);
        assert_eq!(calls.load(Ordering::Acquire), 4);
    }

    #[test]
    fn dead_helpers_shrink_the_run() {
        let (sender, receiver) = unbounded::<Job>();
        drop(receiver);
        let pool = GCThreadPool {
            sender: Some(sender),
            threads: vec![std::thread::spawn(|| {}), std::thread::spawn(|| {})],
        };
        assert_eq!(pool.size(), 3);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut reported = 0;
        let ran = pool.run_with(
            3,
            Arc::new(move |id| {
                assert_eq!(id, 0);
                counter.fetch_add(1, Ordering::AcqRel);
            }),
            |n| reported = n,
        );
        assert_eq!(ran, 1);
        assert_eq!(reported, 1);
        assert_eq!(calls.load(Ordering::Acquire), 1);
    }

    #[test]
    fn worker_count_is_clamped_to_pool_size() {
        let pool = GCThreadPool::new(1);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let ran = pool.run(
            8,
            Arc::new(move |_| {
                counter.fetch_add(1, Ordering::AcqRel);
            }),
        );
        assert_eq!(ran, 2);
        assert_eq!(calls.load(Ordering::Acquire), 2);
    }
}
