//! A pool of worker `EventLoopThread`s, handing out loops round-robin.
//! Modeled on muduo's `EventLoopThreadPool`.
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::event_loop::EventLoopHandle;
use crate::event_loop_thread::EventLoopThread;

/// A user-supplied callback invoked once on each worker thread, right
/// after its `EventLoop` is constructed and before the cycle begins.
/// Mirrors muduo's `ThreadInitCallback` wired through
/// `TcpServer::setThreadInitCallback`; unlike `event_loop_thread`'s
/// one-shot `FnOnce` version this is invoked once per worker, so it must
/// be `Fn`.
pub type PoolInitCallback = Arc<dyn Fn(&EventLoopHandle) + Send + Sync>;

/// Owns zero or more worker threads, each running its own `EventLoop`, and
/// hands out handles to them round-robin.
pub struct EventLoopThreadPool {
    base_loop: EventLoopHandle,
    threads: Vec<EventLoopThread>,
    handles: Vec<EventLoopHandle>,
    next: AtomicUsize,
}

impl EventLoopThreadPool {
    /// Creates a pool of `num_threads` workers, started immediately. With
    /// `num_threads == 0` the pool hands out `base_loop` for every
    /// connection instead, matching muduo's single-threaded mode.
    /// `init_cb`, if set, runs once on each worker thread after its loop
    /// is constructed but before it starts dispatching.
    pub fn new(base_loop: EventLoopHandle, num_threads: usize, init_cb: Option<PoolInitCallback>) -> Self {
        let mut threads = Vec::with_capacity(num_threads);
        let mut handles = Vec::with_capacity(num_threads);
        for i in 0..num_threads {
            let mut thread = EventLoopThread::new();
            let user_init = init_cb.clone();
            let handle = thread.start_loop(Some(Box::new(move |handle| {
                tracing::info!(worker = i, "worker event loop started");
                if let Some(user_init) = user_init {
                    user_init(handle);
                }
            })));
            handles.push(handle);
            threads.push(thread);
        }
        EventLoopThreadPool {
            base_loop,
            threads,
            handles,
            next: AtomicUsize::new(0),
        }
    }

    /// Returns the next loop in round-robin order, or the main loop if the
    /// pool has no worker threads.
    pub fn get_next_loop(&self) -> EventLoopHandle {
        if self.handles.is_empty() {
            return self.base_loop.clone();
        }
        let i = self.next.fetch_add(1, Ordering::Relaxed) % self.handles.len();
        self.handles[i].clone()
    }

    /// All worker loops (empty if this pool has no dedicated threads).
    pub fn all_loops(&self) -> &[EventLoopHandle] {
        &self.handles
    }

    /// Stops every worker thread and waits for them to exit.
    pub fn join_all(&mut self) {
        for thread in &mut self.threads {
            thread.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop::EventLoop;

    #[test]
    fn zero_threads_always_returns_the_base_loop() {
        let mut base = EventLoop::new().unwrap();
        let base_handle = base.handle();
        let pool = EventLoopThreadPool::new(base_handle.clone(), 0, None);
        assert!(pool.get_next_loop().is_in_loop_thread());
        base_handle.quit();
        base.run();
    }

    #[test]
    fn round_robins_across_worker_threads() {
        let mut base = EventLoop::new().unwrap();
        let base_handle = base.handle();
        let mut pool = EventLoopThreadPool::new(base_handle.clone(), 3, None);
        assert_eq!(pool.all_loops().len(), 3);
        let _first = pool.get_next_loop();
        let _second = pool.get_next_loop();
        let _third = pool.get_next_loop();
        let _fourth = pool.get_next_loop();
        pool.join_all();
        base_handle.quit();
        base.run();
    }

    #[test]
    fn init_callback_runs_once_per_worker() {
        let mut base = EventLoop::new().unwrap();
        let base_handle = base.handle();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        let init: PoolInitCallback = Arc::new(move |_| {
            count2.fetch_add(1, Ordering::SeqCst);
        });
        let mut pool = EventLoopThreadPool::new(base_handle.clone(), 2, Some(init));
        pool.join_all();
        assert_eq!(count.load(Ordering::SeqCst), 2);
        base_handle.quit();
        base.run();
    }
}
