//! One reactor cycle pinned to a single OS thread, modeled on muduo's
//! `EventLoop`.
//!
//! Ownership is split in two: [`EventLoop`] itself (the `Poll` instance,
//! the `Events` batch, the run loop) never leaves the thread that created
//! it, while [`EventLoopHandle`] (a cheap `Arc` clone) is what `Channel`s,
//! `TcpConnection`s and other threads hold to call back into the loop --
//! posting tasks, reading the registry, or routing a `Token` to its
//! dispatch target. This replaces muduo's raw `EventLoop*` back-pointer
//! stored in every `Channel`.
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::ThreadId;
use std::time::{Duration, Instant};

use mio::{Events, Poll, Registry, Token, Waker};
use slab::Slab;

use crate::error::ReactorError;

/// A unit of work posted to an event loop, to be run on its own thread.
pub type Task = Box<dyn FnOnce() + Send>;

/// Default `Poll::poll` timeout when there is nothing else to wait for,
/// matching muduo's `kPollTimeMs`.
const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(10);

/// Reserved token identifying the cross-thread wakeup handle. `mio::Waker`
/// self-drains its wakeup byte internally, so unlike muduo's raw eventfd
/// this token is special-cased directly in the dispatch loop instead of
/// being wrapped in a full `Channel`.
pub const WAKE_TOKEN: Token = Token(usize::MAX - 1);

/// Anything a `Token` can be routed to on `Poll::poll` wakeup. Implemented
/// by `TcpConnection` and `Acceptor`; stored behind a `Weak` so that a
/// channel whose owner has already been dropped is silently skipped,
/// rather than needing every caller to keep the dispatch table in lockstep
/// with teardown.
pub trait EventSink: Send + Sync {
    /// Handles one readiness event addressed to this sink's channel.
    fn handle_event(&self, event: &mio::event::Event, receive_time: Instant);
}

struct Shared {
    registry: Registry,
    thread_id: ThreadId,
    quit: AtomicBool,
    waker: Waker,
    pending: Mutex<Vec<Task>>,
    in_pending_phase: AtomicBool,
    sinks: Mutex<HashMap<Token, Weak<dyn EventSink>>>,
    tokens: Mutex<Slab<()>>,
}

/// A cheaply cloneable handle to a running event loop, usable from any
/// thread. This is what `Channel`, `TcpConnection` and `TcpServer` hold
/// instead of a raw pointer back to the loop itself.
#[derive(Clone)]
pub struct EventLoopHandle {
    shared: Arc<Shared>,
}

impl EventLoopHandle {
    /// A clone of the registry backing this loop's readiness source.
    pub fn registry(&self) -> Registry {
        self.shared.registry.clone()
    }

    /// Whether the calling thread is the one running this loop.
    pub fn is_in_loop_thread(&self) -> bool {
        std::thread::current().id() == self.shared.thread_id
    }

    /// Runs `task` immediately if called from the loop's own thread,
    /// otherwise queues it to run on the loop's next iteration.
    pub fn run_in_loop(&self, task: Task) {
        if self.is_in_loop_thread() {
            task();
        } else {
            self.queue_in_loop(task);
        }
    }

    /// Queues `task` to run on the loop's thread, waking the loop if
    /// necessary. A task posted while the loop is mid-way through running
    /// a previous batch of pending tasks also triggers a wakeup, so that a
    /// loop that keeps re-queuing work to itself can't starve on one
    /// `Poll::poll` cycle forever.
    pub fn queue_in_loop(&self, task: Task) {
        let should_wake = {
            let mut pending = self.shared.pending.lock().unwrap();
            pending.push(task);
            !self.is_in_loop_thread() || self.shared.in_pending_phase.load(Ordering::Acquire)
        };
        if should_wake {
            if let Err(e) = self.shared.waker.wake() {
                tracing::error!(error = %e, "failed to wake event loop");
            }
        }
    }

    /// Allocates a fresh token unique to this loop, for a newly registered
    /// channel.
    pub fn alloc_token(&self) -> Token {
        let mut tokens = self.shared.tokens.lock().unwrap();
        Token(tokens.insert(()))
    }

    /// Releases a token previously obtained from `alloc_token`.
    pub fn free_token(&self, token: Token) {
        let mut tokens = self.shared.tokens.lock().unwrap();
        if tokens.contains(token.0) {
            tokens.remove(token.0);
        }
    }

    /// Registers `sink` as the dispatch target for events on `token`.
    pub fn register_sink(&self, token: Token, sink: Weak<dyn EventSink>) {
        self.shared.sinks.lock().unwrap().insert(token, sink);
    }

    /// Removes the dispatch target for `token`, if any.
    pub fn unregister_sink(&self, token: Token) {
        self.shared.sinks.lock().unwrap().remove(&token);
    }

    /// Requests that the loop's `run` method return after its current
    /// iteration. Safe to call from any thread.
    pub fn quit(&self) {
        self.shared.quit.store(true, Ordering::Release);
        if !self.is_in_loop_thread() {
            let _ = self.shared.waker.wake();
        }
    }
}

/// One reactor cycle: owns the `Poll` instance and drives dispatch. Must
/// stay on the thread that created it.
pub struct EventLoop {
    shared: Arc<Shared>,
    poll: Poll,
    events: Events,
}

impl EventLoop {
    /// Creates a new event loop bound to the calling thread.
    pub fn new() -> Result<Self, ReactorError> {
        let poll = Poll::new().map_err(ReactorError::Poll)?;
        let waker =
            Waker::new(poll.registry(), WAKE_TOKEN).map_err(ReactorError::Waker)?;
        let shared = Arc::new(Shared {
            registry: poll.registry().clone(),
            thread_id: std::thread::current().id(),
            quit: AtomicBool::new(false),
            waker,
            pending: Mutex::new(Vec::new()),
            in_pending_phase: AtomicBool::new(false),
            sinks: Mutex::new(HashMap::new()),
            tokens: Mutex::new(Slab::new()),
        });
        Ok(EventLoop {
            shared,
            poll,
            events: Events::with_capacity(1024),
        })
    }

    /// A cloneable handle other threads (or this loop's own channels) can
    /// use to talk back to this loop.
    pub fn handle(&self) -> EventLoopHandle {
        EventLoopHandle {
            shared: self.shared.clone(),
        }
    }

    /// Runs the reactor cycle until `EventLoopHandle::quit` is called:
    /// poll for readiness, dispatch each event to its registered sink, then
    /// drain and run any tasks posted via `run_in_loop`/`queue_in_loop`.
    pub fn run(&mut self) {
        tracing::info!("EventLoop started");
        while !self.shared.quit.load(Ordering::Acquire) {
            match self.poll.poll(&mut self.events, Some(DEFAULT_POLL_TIMEOUT)) {
                Ok(()) => {
                    let receive_time = Instant::now();
                    self.dispatch_events(receive_time);
                    self.run_pending_tasks();
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::error!(error = %e, "poll failed");
                    break;
                }
            }
        }
        tracing::info!("EventLoop stopping");
    }

    fn dispatch_events(&self, receive_time: Instant) {
        for event in self.events.iter() {
            let token = event.token();
            if token == WAKE_TOKEN {
                continue;
            }
            let sink = self.shared.sinks.lock().unwrap().get(&token).cloned();
            if let Some(weak_sink) = sink {
                if let Some(sink) = weak_sink.upgrade() {
                    sink.handle_event(event, receive_time);
                }
            }
        }
    }

    fn run_pending_tasks(&self) {
        let tasks = {
            let mut pending = self.shared.pending.lock().unwrap();
            std::mem::take(&mut *pending)
        };
        self.shared.in_pending_phase.store(true, Ordering::Release);
        for task in tasks {
            task();
        }
        self.shared.in_pending_phase.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[test]
    fn run_in_loop_from_owning_thread_executes_synchronously() {
        let mut loop_ = EventLoop::new().unwrap();
        let handle = loop_.handle();
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();
        handle.run_in_loop(Box::new(move || {
            ran2.store(true, Ordering::SeqCst);
        }));
        assert!(ran.load(Ordering::SeqCst));
        handle.quit();
        loop_.run();
    }

    #[test]
    fn queue_in_loop_from_another_thread_wakes_the_loop() {
        let mut loop_ = EventLoop::new().unwrap();
        let handle = loop_.handle();
        let counter = Arc::new(AtomicUsize::new(0));
        let counter2 = counter.clone();
        let handle2 = handle.clone();

        let worker = thread::spawn(move || {
            handle2.queue_in_loop(Box::new(move || {
                counter2.fetch_add(1, Ordering::SeqCst);
            }));
        });
        worker.join().unwrap();

        // Give the loop one iteration to pick up the queued task, then quit.
        let handle3 = handle.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            handle3.quit();
        });
        loop_.run();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
