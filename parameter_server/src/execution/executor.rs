use std::{collections::VecDeque, sync::Arc};

use parking_lot::{Condvar, Mutex};

type Task = Box<dyn FnOnce() + Send>;

/// Completion signal for one queued block, waited on by the caller.
#[derive(Default)]
struct Signal {
    done: Mutex<bool>,
    cv: Condvar,
}

impl Signal {
    fn notify(&self) {
        *self.done.lock() = true;
        self.cv.notify_all();
    }

    fn wait(&self) {
        let mut done = self.done.lock();
        while !*done {
            self.cv.wait(&mut done);
        }
    }
}

struct Block {
    /// `None` is the stop sentinel.
    task: Option<Task>,
    signal: Arc<Signal>,
}

/// Runs closures on a single owner thread.
///
/// The thread that calls [`Executor::run`] becomes the owner; any other
/// thread may hand it work with [`Executor::exec`], which blocks until the
/// closure has run to completion over there. Host callbacks that need a
/// stable thread identity (an interpreter lock, a runtime thread binding)
/// go through here.
///
/// Calling `exec` from the owner thread itself deadlocks by design: the
/// queue is strictly FIFO and the owner would wait on a block behind the
/// one it is executing.
#[derive(Default)]
pub struct Executor {
    queue: Mutex<VecDeque<Block>>,
    cv: Condvar,
}

impl Executor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consumes the calling thread as the executor's owner, running queued
    /// closures until the stop sentinel is reached.
    pub fn run(&self) {
        loop {
            let block = {
                let mut queue = self.queue.lock();
                while queue.is_empty() {
                    self.cv.wait(&mut queue);
                }
                queue.pop_front().unwrap()
            };

            match block.task {
                Some(task) => {
                    task();
                    block.signal.notify();
                }
                None => {
                    block.signal.notify();
                    break;
                }
            }
        }
    }

    /// Runs `task` on the owner thread, blocking the caller until it
    /// completes. Safe from any thread except the owner itself.
    pub fn exec(&self, task: impl FnOnce() + Send + 'static) {
        self.push(Some(Box::new(task)));
    }

    /// Enqueues the stop sentinel and blocks until the owner thread has
    /// drained everything ahead of it and exited.
    pub fn stop(&self) {
        self.push(None);
    }

    fn push(&self, task: Option<Task>) {
        let signal = Arc::new(Signal::default());
        {
            let mut queue = self.queue.lock();
            queue.push_back(Block {
                task,
                signal: signal.clone(),
            });
            self.cv.notify_one();
        }
        signal.wait();
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        thread,
    };

    use super::*;

    #[test]
    fn test_exec_blocks_until_run() {
        let exec = Arc::new(Executor::new());
        let hits = Arc::new(AtomicUsize::new(0));

        let owner = {
            let exec = exec.clone();
            thread::spawn(move || exec.run())
        };

        for _ in 0..3 {
            let hits = hits.clone();
            exec.exec(move || {
                hits.fetch_add(1, Ordering::SeqCst);
            });
        }

        // exec returned, so the closure has already run over there.
        assert_eq!(hits.load(Ordering::SeqCst), 3);
        exec.stop();
        owner.join().unwrap();
    }

    #[test]
    fn test_closures_run_on_the_owner_thread() {
        let exec = Arc::new(Executor::new());

        let owner = {
            let exec = exec.clone();
            thread::spawn(move || {
                exec.run();
                thread::current().id()
            })
        };

        let seen = Arc::new(Mutex::new(None));
        {
            let seen = seen.clone();
            exec.exec(move || {
                *seen.lock() = Some(thread::current().id());
            });
        }

        exec.stop();
        let owner_id = owner.join().unwrap();
        assert_eq!(seen.lock().unwrap(), owner_id);
    }

    #[test]
    fn test_fifo_across_threads() {
        let exec = Arc::new(Executor::new());
        let order = Arc::new(Mutex::new(Vec::new()));

        let owner = {
            let exec = exec.clone();
            thread::spawn(move || exec.run())
        };

        let callers: Vec<_> = (0..4)
            .map(|i| {
                let exec = exec.clone();
                let order = order.clone();
                thread::spawn(move || {
                    exec.exec(move || order.lock().push(i));
                })
            })
            .collect();
        for caller in callers {
            caller.join().unwrap();
        }

        exec.stop();
        owner.join().unwrap();
        let mut seen = order.lock().clone();
        seen.sort_unstable();
        assert_eq!(seen, [0, 1, 2, 3]);
    }

    #[test]
    fn test_stop_drains_queued_work() {
        let exec = Arc::new(Executor::new());
        let hits = Arc::new(AtomicUsize::new(0));

        let stopper = {
            let exec = exec.clone();
            let hits = hits.clone();
            thread::spawn(move || {
                let h = hits.clone();
                exec.exec(move || {
                    h.fetch_add(1, Ordering::SeqCst);
                });
                exec.stop();
            })
        };

        exec.run();
        stopper.join().unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
