//! The listening-socket half of a server: owns the bound, listening socket
//! and hands accepted streams off to a new-connection callback. Modeled on
//! muduo's `Acceptor`, always run on the main loop.
use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;
use std::sync::{Arc, Mutex};

use mio::net::TcpListener as MioTcpListener;
use mio::Token;

use crate::channel::Channel;
use crate::error::ReactorError;
use crate::event_loop::{EventLoopHandle, EventSink};
use crate::socket;

/// Invoked with each accepted stream and its peer address, on the main
/// loop. If unset, accepted connections are simply dropped (closing the
/// fd), matching muduo's behavior when `newConnectionCallback_` is unset.
pub type NewConnectionCallback = Box<dyn FnMut(mio::net::TcpStream, SocketAddr) + Send>;

/// Owns the listening socket and its channel; lives for the server's
/// lifetime on the main loop.
pub struct Acceptor {
    listener: Mutex<MioTcpListener>,
    channel: Mutex<Channel>,
    listening: Mutex<bool>,
    new_connection_callback: Mutex<Option<NewConnectionCallback>>,
}

impl Acceptor {
    /// Binds and configures a non-blocking listening socket for `addr` on
    /// `loop_handle`, but does not yet start listening or register read
    /// interest -- call [`Acceptor::listen`] for that.
    pub fn new(loop_handle: &EventLoopHandle, addr: SocketAddr, reuse_port: bool) -> Result<Arc<Self>, ReactorError> {
        let listener = socket::bind_listener(addr, reuse_port)?;
        let fd = listener.as_raw_fd();
        let token = loop_handle.alloc_token();
        let channel = Channel::new(loop_handle.registry(), fd, token);

        Ok(Arc::new_cyclic(|weak: &std::sync::Weak<Acceptor>| {
            let weak_for_sink = weak.clone() as std::sync::Weak<dyn EventSink>;
            loop_handle.register_sink(token, weak_for_sink);

            let mut channel = channel;
            let weak_for_read = weak.clone();
            channel.set_read_callback(move |_now| {
                if let Some(acceptor) = weak_for_read.upgrade() {
                    acceptor.handle_read();
                }
            });

            Acceptor {
                listener: Mutex::new(listener),
                channel: Mutex::new(channel),
                listening: Mutex::new(false),
                new_connection_callback: Mutex::new(None),
            }
        }))
    }

    /// Sets the callback invoked for each accepted connection.
    pub fn set_new_connection_callback(&self, cb: NewConnectionCallback) {
        *self.new_connection_callback.lock().unwrap() = Some(cb);
    }

    /// Starts listening and registers read interest on the main loop.
    /// Idempotent.
    pub fn listen(&self) {
        let mut listening = self.listening.lock().unwrap();
        if *listening {
            return;
        }
        *listening = true;
        self.channel.lock().unwrap().enable_reading();
        tracing::info!("acceptor listening");
    }

    /// Performs exactly one non-blocking accept per readable event. Each
    /// accepted stream is handed to the new-connection callback, or
    /// dropped if none is set. A `WouldBlock` result means some other fd's
    /// readiness woke this batch; any other accept failure is logged.
    fn handle_read(&self) {
        match self.listener.lock().unwrap().accept() {
            Ok((stream, peer_addr)) => {
                if let Err(e) = socket::enable_keepalive(&stream) {
                    tracing::error!(error = %e, "failed to set SO_KEEPALIVE on accepted socket");
                }
                let mut cb = self.new_connection_callback.lock().unwrap();
                match cb.as_mut() {
                    Some(cb) => cb(stream, peer_addr),
                    None => drop(stream),
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) => match e.raw_os_error() {
                Some(libc::EMFILE) | Some(libc::ENFILE) => {
                    tracing::error!(error = %e, "accept failed: too many open files");
                }
                _ => tracing::error!(error = %e, "accept failed"),
            },
        }
    }

    /// The bound local address, read back from the OS -- the caller's
    /// `addr` may have been an ephemeral-port wildcard like `:0`.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.lock().unwrap().local_addr()
    }
}

impl EventSink for Acceptor {
    fn handle_event(&self, event: &mio::event::Event, receive_time: std::time::Instant) {
        let dispatch = {
            let mut channel = self.channel.lock().unwrap();
            match channel.take_dispatch(event, receive_time) {
                Some(d) => d,
                None => return,
            }
        };

        if let Some(mut cb) = dispatch.close {
            cb();
            self.channel.lock().unwrap().restore_close(cb);
            return;
        }

        if let Some(mut cb) = dispatch.error {
            cb();
            self.channel.lock().unwrap().restore_error(cb);
        }

        if let Some((mut cb, receive_time)) = dispatch.read {
            cb(receive_time);
            self.channel.lock().unwrap().restore_read(cb);
        }

        if let Some(mut cb) = dispatch.write {
            cb();
            self.channel.lock().unwrap().restore_write(cb);
        }
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        let mut channel = self.channel.lock().unwrap();
        channel.disable_all();
        channel.remove();
    }
}
