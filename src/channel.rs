//! The binding between one file descriptor and its event-dispatch
//! callbacks on a specific loop, modeled on muduo's `Channel`.
//!
//! Registration with the readiness source only needs the raw fd (epoll
//! doesn't care about the owning type), so a `Channel` talks to a cloned
//! `mio::Registry` directly via `mio::unix::SourceFd` instead of routing
//! through its owning `EventLoop`. What *does* need to go through the
//! owning loop -- routing a `Token` back to the right dispatch target on
//! `Poll::poll` -- is handled separately by `EventLoop`'s sink table; see
//! `crate::event_loop::EventSink`.
use std::any::Any;
use std::fmt;
use std::os::unix::io::RawFd;
use std::sync::Weak;
use std::time::Instant;

use mio::event::Event;
use mio::unix::SourceFd;
use mio::{Interest, Registry, Token};

type ReadCallback = Box<dyn FnMut(Instant) + Send>;
type EventCallback = Box<dyn FnMut() + Send>;

/// The callbacks due to fire for one dispatched event, taken out of their
/// `Channel` under a short-lived lock so the caller can drop that lock
/// *before* invoking any of them. This is what lets a callback (e.g.
/// `messageCallback` calling `TcpConnection::send`) safely re-lock the same
/// channel to mutate its interest mask instead of deadlocking against a
/// lock the dispatcher is still holding.
#[derive(Default)]
pub struct Dispatch {
    pub close: Option<EventCallback>,
    pub error: Option<EventCallback>,
    pub read: Option<(ReadCallback, Instant)>,
    pub write: Option<EventCallback>,
}

/// One file descriptor's registration state and dispatch callbacks.
pub struct Channel {
    registry: Registry,
    fd: RawFd,
    token: Token,
    interest: Option<Interest>,
    registered: bool,
    tie: Option<Weak<dyn Any + Send + Sync>>,
    read_callback: Option<ReadCallback>,
    write_callback: Option<EventCallback>,
    close_callback: Option<EventCallback>,
    error_callback: Option<EventCallback>,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("fd", &self.fd)
            .field("token", &self.token)
            .field("interest", &self.interest)
            .field("registered", &self.registered)
            .finish()
    }
}

impl Channel {
    /// Creates a channel for `fd` under `token`, bound to the readiness
    /// source behind `registry`. Starts with no interest and no tie.
    pub fn new(registry: Registry, fd: RawFd, token: Token) -> Self {
        Channel {
            registry,
            fd,
            token,
            interest: None,
            registered: false,
            tie: None,
            read_callback: None,
            write_callback: None,
            close_callback: None,
            error_callback: None,
        }
    }

    /// The file descriptor this channel governs.
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// The token this channel is (or will be) registered under.
    pub fn token(&self) -> Token {
        self.token
    }

    /// Ties this channel's dispatch to the liveness of `owner`. Once tied,
    /// `take_dispatch` upgrades the weak reference before handing back any
    /// callback and returns `None` silently if the owner is already gone --
    /// the Rust realization of muduo's `shared_from_this()` guard.
    pub fn tie(&mut self, owner: Weak<dyn Any + Send + Sync>) {
        self.tie = Some(owner);
    }

    /// Sets the callback invoked when the channel is readable.
    pub fn set_read_callback(&mut self, cb: impl FnMut(Instant) + Send + 'static) {
        self.read_callback = Some(Box::new(cb));
    }

    /// Sets the callback invoked when the channel is writable.
    pub fn set_write_callback(&mut self, cb: impl FnMut() + Send + 'static) {
        self.write_callback = Some(Box::new(cb));
    }

    /// Sets the callback invoked on hangup.
    pub fn set_close_callback(&mut self, cb: impl FnMut() + Send + 'static) {
        self.close_callback = Some(Box::new(cb));
    }

    /// Sets the callback invoked when the channel enters an error state.
    pub fn set_error_callback(&mut self, cb: impl FnMut() + Send + 'static) {
        self.error_callback = Some(Box::new(cb));
    }

    /// Whether write readiness is currently in this channel's interest set.
    pub fn is_writing(&self) -> bool {
        matches!(self.interest, Some(i) if i.is_writable())
    }

    /// Whether read readiness is currently in this channel's interest set.
    pub fn is_reading(&self) -> bool {
        matches!(self.interest, Some(i) if i.is_readable())
    }

    /// Adds read readiness to the interest set and updates the
    /// registration.
    pub fn enable_reading(&mut self) {
        self.interest = Some(match self.interest {
            Some(i) => i.add(Interest::READABLE),
            None => Interest::READABLE,
        });
        self.update();
    }

    /// Removes read readiness from the interest set.
    pub fn disable_reading(&mut self) {
        self.remove_interest(Interest::READABLE);
    }

    /// Adds write readiness to the interest set and updates the
    /// registration.
    pub fn enable_writing(&mut self) {
        self.interest = Some(match self.interest {
            Some(i) => i.add(Interest::WRITABLE),
            None => Interest::WRITABLE,
        });
        self.update();
    }

    /// Removes write readiness from the interest set.
    pub fn disable_writing(&mut self) {
        self.remove_interest(Interest::WRITABLE);
    }

    /// Clears all interest, deregistering the channel from the readiness
    /// source without forgetting its callbacks (mirrors `disableAll`).
    pub fn disable_all(&mut self) {
        self.interest = None;
        self.update();
    }

    fn remove_interest(&mut self, remove: Interest) {
        self.interest = match self.interest {
            Some(i) => Interest::remove(i, remove),
            None => None,
        };
        self.update();
    }

    /// Registers, re-registers or deregisters with the readiness source
    /// depending on whether the channel was already added and what its
    /// interest mask is now. Mirrors `EventLoop::updateChannel` deciding
    /// between `EPOLL_CTL_ADD`/`MOD`/`DEL`.
    fn update(&mut self) {
        let mut source = SourceFd(&self.fd);
        let result = match (self.registered, self.interest) {
            (false, Some(interest)) => self.registry.register(&mut source, self.token, interest),
            (true, Some(interest)) => self.registry.reregister(&mut source, self.token, interest),
            (true, None) => self.registry.deregister(&mut source),
            (false, None) => Ok(()),
        };
        match result {
            Ok(()) => self.registered = self.interest.is_some(),
            Err(e) => tracing::error!(fd = self.fd, error = %e, "failed to update channel interest"),
        }
    }

    /// Unconditionally removes the channel from the readiness source.
    /// Idempotent: safe to call on a channel that was never added.
    pub fn remove(&mut self) {
        if self.registered {
            let mut source = SourceFd(&self.fd);
            if let Err(e) = self.registry.deregister(&mut source) {
                tracing::error!(fd = self.fd, error = %e, "failed to deregister channel");
            }
            self.registered = false;
        }
        self.interest = None;
    }

    /// Determines which callbacks are due to fire for one readiness event,
    /// in the order mandated by the component design: close (on hangup
    /// without a pending read), then error, then read, then write -- and
    /// takes them out of `self`. If tied and the owner has already been
    /// dropped, returns `None` before touching any callback.
    ///
    /// Callbacks are taken rather than invoked here so the caller can drop
    /// whatever lock it holds around this `Channel` *before* running any of
    /// them -- a callback (e.g. `messageCallback` calling
    /// `TcpConnection::send`) may need to re-lock this same channel to
    /// mutate its interest mask, which would deadlock against a lock held
    /// across the callback itself. Callers restore each taken callback with
    /// `restore_read`/`restore_write`/`restore_close`/`restore_error` once
    /// it returns.
    pub fn take_dispatch(&mut self, event: &Event, receive_time: Instant) -> Option<Dispatch> {
        if let Some(tie) = &self.tie {
            tie.upgrade()?;
        }

        let hangup = event.is_hup();

        if hangup && !event.is_readable() {
            return Some(Dispatch {
                close: self.close_callback.take(),
                ..Default::default()
            });
        }

        let mut dispatch = Dispatch::default();
        if event.is_error() {
            dispatch.error = self.error_callback.take();
        }
        if event.is_readable() || event.is_priority() {
            dispatch.read = self.read_callback.take().map(|cb| (cb, receive_time));
        }
        if event.is_writable() {
            dispatch.write = self.write_callback.take();
        }
        Some(dispatch)
    }

    /// Restores a read callback previously taken by `take_dispatch`.
    pub fn restore_read(&mut self, cb: ReadCallback) {
        self.read_callback = Some(cb);
    }

    /// Restores a write callback previously taken by `take_dispatch`.
    pub fn restore_write(&mut self, cb: EventCallback) {
        self.write_callback = Some(cb);
    }

    /// Restores a close callback previously taken by `take_dispatch`.
    pub fn restore_close(&mut self, cb: EventCallback) {
        self.close_callback = Some(cb);
    }

    /// Restores an error callback previously taken by `take_dispatch`.
    pub fn restore_error(&mut self, cb: EventCallback) {
        self.error_callback = Some(cb);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::{Poll, Token};
    use std::net::TcpListener as StdTcpListener;
    use std::os::unix::io::AsRawFd;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn make_channel() -> (Poll, Channel, StdTcpListener) {
        let poll = Poll::new().unwrap();
        let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
        listener.set_nonblocking(true).unwrap();
        let fd = listener.as_raw_fd();
        let channel = Channel::new(poll.registry().clone(), fd, Token(1));
        (poll, channel, listener)
    }

    #[test]
    fn enable_reading_then_disable_all_is_idempotent_to_remove() {
        let (_poll, mut channel, _listener) = make_channel();
        channel.enable_reading();
        assert!(channel.is_reading());
        channel.disable_all();
        assert!(!channel.is_reading());
        channel.remove();
        channel.remove();
    }

    #[test]
    fn dropped_tie_owner_suppresses_all_callbacks() {
        let (_poll, mut channel, _listener) = make_channel();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        channel.set_read_callback(move |_now| {
            fired2.fetch_add(1, Ordering::SeqCst);
        });

        let owner: Arc<()> = Arc::new(());
        channel.tie(Arc::downgrade(&owner) as Weak<dyn Any + Send + Sync>);
        drop(owner);

        // Build a synthetic readable event isn't possible without touching
        // mio internals directly from a unit test; the guard check itself
        // is exercised end to end by the echo integration test instead.
        // Here we only assert that tying after the owner is already gone
        // leaves the channel able to report its state without panicking.
        assert!(!channel.is_reading());
    }
}
