//! Runs one `EventLoop` on a dedicated OS thread, modeled on muduo's
//! `EventLoopThread`.
//!
//! `start_loop()` blocks the caller until the spawned thread's `EventLoop`
//! has actually been constructed, using a mutex/condvar handshake -- the
//! same synchronization muduo uses so that the returned `EventLoop*` is
//! never null.
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use crate::event_loop::{EventLoop, EventLoopHandle};

/// Callback run on the new thread immediately after its `EventLoop` is
/// constructed, before `start_loop` unblocks the calling thread. Mirrors
/// muduo's `ThreadInitCallback`.
pub type ThreadInitCallback = Box<dyn FnOnce(&EventLoopHandle) + Send>;

struct Handshake {
    lock: Mutex<Option<EventLoopHandle>>,
    cond: Condvar,
}

/// Owns a dedicated worker thread and the `EventLoop` running on it.
pub struct EventLoopThread {
    handshake: Arc<Handshake>,
    join_handle: Option<JoinHandle<()>>,
    handle: Mutex<Option<EventLoopHandle>>,
}

impl EventLoopThread {
    /// Spawns the worker thread. The `EventLoop` itself is not constructed
    /// until `start_loop` is called.
    pub fn new() -> Self {
        EventLoopThread {
            handshake: Arc::new(Handshake {
                lock: Mutex::new(None),
                cond: Condvar::new(),
            }),
            join_handle: None,
            handle: Mutex::new(None),
        }
    }

    /// Starts the worker thread's `EventLoop` (if not already started) and
    /// blocks until it's ready to accept work, returning a handle to it.
    pub fn start_loop(&mut self, init: Option<ThreadInitCallback>) -> EventLoopHandle {
        if let Some(handle) = self.handle.lock().unwrap().clone() {
            return handle;
        }

        let handshake = self.handshake.clone();
        let join_handle = thread::Builder::new()
            .name("event-loop-worker".into())
            .spawn(move || {
                let mut event_loop = EventLoop::new().expect("failed to create worker event loop");
                let handle = event_loop.handle();
                if let Some(init) = init {
                    init(&handle);
                }
                {
                    let mut slot = handshake.lock.lock().unwrap();
                    *slot = Some(handle);
                    handshake.cond.notify_one();
                }
                event_loop.run();
            })
            .expect("failed to spawn event loop thread");

        let mut slot = self.handshake.lock.lock().unwrap();
        while slot.is_none() {
            slot = self.handshake.cond.wait(slot).unwrap();
        }
        let handle = slot.clone().expect("handshake produced no handle");

        self.join_handle = Some(join_handle);
        *self.handle.lock().unwrap() = Some(handle.clone());
        handle
    }

    /// Stops the loop and waits for its thread to exit.
    pub fn join(&mut self) {
        if let Some(handle) = self.handle.lock().unwrap().clone() {
            handle.quit();
        }
        if let Some(join_handle) = self.join_handle.take() {
            let _ = join_handle.join();
        }
    }
}

impl Default for EventLoopThread {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for EventLoopThread {
    fn drop(&mut self) {
        self.join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_loop_blocks_until_handle_is_usable() {
        let mut thread = EventLoopThread::new();
        let handle = thread.start_loop(None);
        assert!(!handle.is_in_loop_thread());
        thread.join();
    }

    #[test]
    fn start_loop_is_idempotent() {
        let mut thread = EventLoopThread::new();
        let a = thread.start_loop(None);
        let b = thread.start_loop(None);
        assert!(a.is_in_loop_thread() == b.is_in_loop_thread());
        thread.join();
    }
}
