use rayon::{ThreadPool, ThreadPoolBuilder};

/// The pool the server runs outbound model-distribution loops on, so a
/// loop blocked on a receiver never stalls request handling.
///
/// With one thread, queued loops run one after the other: the distribution
/// for an iteration finishes before the next one starts. Size zero means
/// push-based distribution is disabled and enqueueing is a usage error.
pub struct DistributionPool {
    pool: Option<ThreadPool>,
}

impl DistributionPool {
    /// Builds a pool with a fixed number of threads; zero disables it.
    pub fn new(threads: usize) -> Self {
        let pool = (threads > 0).then(|| {
            ThreadPoolBuilder::new()
                .num_threads(threads)
                .thread_name(|i| format!("distribution-{i}"))
                .build()
                .expect("failed to start the distribution pool")
        });

        Self { pool }
    }

    pub fn is_enabled(&self) -> bool {
        self.pool.is_some()
    }

    /// Hands a task to the pool.
    ///
    /// # Panics
    /// If the pool was built with zero threads.
    pub fn enqueue(&self, task: impl FnOnce() + Send + 'static) {
        self.pool
            .as_ref()
            .expect("the distribution pool is disabled")
            .spawn(task);
    }
}
