//! A scoped worker pool for row-level transform work.

use crossbeam_channel as channel;

/// Fans row work out over OS threads and collects results in input
/// order. Worker threads live only for the duration of one `map` call;
/// transform closures borrow freely from the caller's stack.
#[derive(Debug, Clone, Copy)]
pub struct WorkerPool {
    workers: usize,
}

impl WorkerPool {
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
        }
    }

    /// One worker per CPU, leaving a core for the engine's own loop.
    pub fn from_cpus() -> Self {
        Self::new(num_cpus::get().saturating_sub(1))
    }

    /// A pool that runs everything on the calling thread.
    pub fn serial() -> Self {
        Self::new(1)
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Apply `func` to every item, in parallel, preserving input order.
    pub fn map<T, R, F>(&self, items: &[T], func: F) -> Vec<R>
    where
        T: Sync,
        R: Send,
        F: Fn(&T) -> R + Sync,
    {
        if self.workers == 1 || items.len() <= 1 {
            return items.iter().map(&func).collect();
        }

        std::thread::scope(|scope| {
            let (work_tx, work_rx) = channel::unbounded::<(usize, &T)>();
            let (result_tx, result_rx) = channel::unbounded::<(usize, R)>();

            for entry in items.iter().enumerate() {
                let _ = work_tx.send(entry);
            }
            drop(work_tx);

            for _ in 0..self.workers.min(items.len()) {
                let work_rx = work_rx.clone();
                let result_tx = result_tx.clone();
                let func = &func;
                scope.spawn(move || {
                    for (ix, item) in work_rx {
                        let _ = result_tx.send((ix, func(item)));
                    }
                });
            }
            drop(result_tx);

            let mut results: Vec<(usize, R)> = result_rx.iter().collect();
            results.sort_by_key(|(ix, _)| *ix);
            results.into_iter().map(|(_, r)| r).collect()
        })
    }
}
