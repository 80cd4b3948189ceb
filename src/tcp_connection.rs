//! One established TCP connection: its state machine, buffers, and the
//! read/write/close/error handling wired into its `Channel`. Modeled on
//! muduo's `TcpConnection`.
//!
//! `TcpConnection` is always held behind `Arc<TcpConnection>`, built with
//! `Arc::new_cyclic` so the connection can hand a `Weak<Self>` to its own
//! `Channel` (the tie) and to every callback closure without a separate
//! construction step. This is the Rust realization of muduo's
//! `shared_from_this()`.
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use mio::net::TcpStream as MioTcpStream;

use crate::buffer::{write_raw, Buffer};
use crate::channel::Channel;
use crate::event_loop::{EventLoopHandle, EventSink};
use crate::socket;

/// Default high-water mark: once a connection's output buffer holds this
/// many unsent bytes, the high-water-mark callback fires once (until the
/// buffer drains back below the mark).
pub const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024 * 1024;

/// The connection's lifecycle state, exactly muduo's four `StateE` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

/// Called once when a connection is established and once when it is about
/// to be torn down (`handle_close` and `connect_destroyed` both invoke
/// this, matching muduo calling `connectionCallback_` from both places).
pub type ConnectionCallback = Arc<dyn Fn(&Arc<TcpConnection>) + Send + Sync>;
/// Called with the connection, its input buffer, and the time the data was
/// received, whenever bytes arrive.
pub type MessageCallback = Arc<dyn Fn(&Arc<TcpConnection>, &mut Buffer, Instant) + Send + Sync>;
/// Called once the output buffer has fully drained after a partial write.
pub type WriteCompleteCallback = Arc<dyn Fn(&Arc<TcpConnection>) + Send + Sync>;
/// Called, at most once per upward crossing, when the output buffer grows
/// past the high-water mark.
pub type HighWaterMarkCallback = Arc<dyn Fn(&Arc<TcpConnection>, usize) + Send + Sync>;
/// Called once the connection is ready to be erased from its owning
/// server's connection map; always wired by `TcpServer` to
/// `TcpServer::remove_connection`.
pub type CloseCallback = Arc<dyn Fn(&Arc<TcpConnection>) + Send + Sync>;

#[derive(Default)]
struct Callbacks {
    connection: Option<ConnectionCallback>,
    message: Option<MessageCallback>,
    write_complete: Option<WriteCompleteCallback>,
    high_water_mark: Option<HighWaterMarkCallback>,
    close: Option<CloseCallback>,
}

/// One established connection, pinned to whichever worker loop accepted
/// it.
pub struct TcpConnection {
    self_weak: Weak<TcpConnection>,
    name: String,
    loop_handle: EventLoopHandle,
    fd: RawFd,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    state: Mutex<ConnState>,
    channel: Mutex<Channel>,
    stream: Mutex<MioTcpStream>,
    input_buffer: Mutex<Buffer>,
    output_buffer: Mutex<Buffer>,
    high_water_mark: AtomicUsize,
    callbacks: Mutex<Callbacks>,
}

impl TcpConnection {
    /// Constructs a connection for an already-accepted, already-registered
    /// stream. The connection starts in `Connecting` state; call
    /// `connect_established` (posted to `loop_handle`) to move it to
    /// `Connected` and start dispatching reads.
    pub fn new(
        loop_handle: EventLoopHandle,
        name: String,
        stream: MioTcpStream,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
    ) -> Arc<Self> {
        let fd = stream.as_raw_fd();
        let token = loop_handle.alloc_token();
        let channel = Channel::new(loop_handle.registry(), fd, token);

        Arc::new_cyclic(|weak: &Weak<TcpConnection>| {
            loop_handle.register_sink(token, weak.clone() as Weak<dyn EventSink>);

            let mut channel = channel;
            let w = weak.clone();
            channel.set_read_callback(move |now| {
                if let Some(conn) = w.upgrade() {
                    conn.handle_read(now);
                }
            });
            let w = weak.clone();
            channel.set_write_callback(move || {
                if let Some(conn) = w.upgrade() {
                    conn.handle_write();
                }
            });
            let w = weak.clone();
            channel.set_close_callback(move || {
                if let Some(conn) = w.upgrade() {
                    conn.handle_close();
                }
            });
            let w = weak.clone();
            channel.set_error_callback(move || {
                if let Some(conn) = w.upgrade() {
                    conn.handle_error();
                }
            });

            if let Err(e) = socket::enable_keepalive(&stream) {
                tracing::error!(error = %e, "failed to set SO_KEEPALIVE");
            }

            tracing::info!(name = %name, fd, "TcpConnection created");

            TcpConnection {
                self_weak: weak.clone(),
                name,
                loop_handle,
                fd,
                local_addr,
                peer_addr,
                state: Mutex::new(ConnState::Connecting),
                channel: Mutex::new(channel),
                stream: Mutex::new(stream),
                input_buffer: Mutex::new(Buffer::new()),
                output_buffer: Mutex::new(Buffer::new()),
                high_water_mark: AtomicUsize::new(DEFAULT_HIGH_WATER_MARK),
                callbacks: Mutex::new(Callbacks::default()),
            }
        })
    }

    /// The connection's unique name, `"{server_name}-{peer_ip_port}#{id}"`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The remote peer's address.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// The local side's address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnState {
        *self.state.lock().unwrap()
    }

    /// The loop this connection is pinned to, used by `TcpServer` to post
    /// `connect_established`/`connect_destroyed` onto the right thread.
    pub(crate) fn loop_handle(&self) -> &EventLoopHandle {
        &self.loop_handle
    }

    /// Whether the connection is in the `Connected` state.
    pub fn connected(&self) -> bool {
        self.state() == ConnState::Connected
    }

    pub fn set_connection_callback(&self, cb: ConnectionCallback) {
        self.callbacks.lock().unwrap().connection = Some(cb);
    }

    pub fn set_message_callback(&self, cb: MessageCallback) {
        self.callbacks.lock().unwrap().message = Some(cb);
    }

    pub fn set_write_complete_callback(&self, cb: WriteCompleteCallback) {
        self.callbacks.lock().unwrap().write_complete = Some(cb);
    }

    pub fn set_high_water_mark_callback(&self, cb: HighWaterMarkCallback, mark: usize) {
        self.callbacks.lock().unwrap().high_water_mark = Some(cb);
        self.high_water_mark.store(mark, Ordering::Relaxed);
    }

    /// Sets the high-water mark threshold alone, per spec.md's
    /// `setHighWaterMark(nBytes)`, independent of whether a callback is
    /// registered.
    pub fn set_high_water_mark(&self, n: usize) {
        self.high_water_mark.store(n, Ordering::Relaxed);
    }

    pub(crate) fn set_close_callback(&self, cb: CloseCallback) {
        self.callbacks.lock().unwrap().close = Some(cb);
    }

    /// Sets or clears `TCP_NODELAY` on the underlying socket.
    pub fn set_tcp_nodelay(&self, on: bool) -> io::Result<()> {
        socket::set_nodelay(&self.stream.lock().unwrap(), on)
    }

    /// Queues `data` for sending, appending to the output buffer and
    /// registering write interest if the kernel's send buffer can't
    /// absorb it all immediately. A no-op unless the connection is
    /// currently `Connected`.
    pub fn send(self: &Arc<Self>, data: impl AsRef<[u8]>) {
        let data = data.as_ref();
        if self.state() != ConnState::Connected {
            return;
        }
        if self.loop_handle.is_in_loop_thread() {
            self.send_in_loop(data);
        } else {
            let conn = Arc::clone(self);
            let owned = data.to_vec();
            self.loop_handle
                .run_in_loop(Box::new(move || conn.send_in_loop(&owned)));
        }
    }

    fn send_in_loop(self: &Arc<Self>, data: &[u8]) {
        if self.state() == ConnState::Disconnected {
            tracing::error!(name = %self.name, "disconnected, give up writing");
            return;
        }

        let mut nwrote = 0usize;
        let mut remaining = data.len();
        let mut fault_error = false;

        let already_writing = self.channel.lock().unwrap().is_writing();
        if !already_writing && self.output_buffer.lock().unwrap().readable_bytes() == 0 {
            match write_raw(self.fd, data) {
                Ok(n) => {
                    nwrote = n;
                    remaining = data.len() - n;
                    if remaining == 0 {
                        if let Some(cb) = self.callbacks.lock().unwrap().write_complete.clone() {
                            let conn = Arc::clone(self);
                            self.loop_handle
                                .queue_in_loop(Box::new(move || cb(&conn)));
                        }
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    tracing::error!(name = %self.name, error = %e, "TcpConnection::send_in_loop");
                    if matches!(
                        e.kind(),
                        io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset
                    ) {
                        fault_error = true;
                    }
                }
            }
        }

        if !fault_error && remaining > 0 {
            let old_len = self.output_buffer.lock().unwrap().readable_bytes();
            let high_water_mark = self.high_water_mark.load(Ordering::Relaxed);
            if old_len + remaining > high_water_mark
                && old_len <= high_water_mark
            {
                if let Some(cb) = self.callbacks.lock().unwrap().high_water_mark.clone() {
                    let conn = Arc::clone(self);
                    let new_len = old_len + remaining;
                    self.loop_handle
                        .queue_in_loop(Box::new(move || cb(&conn, new_len)));
                }
            }
            self.output_buffer.lock().unwrap().append(&data[nwrote..]);
            let mut channel = self.channel.lock().unwrap();
            if !channel.is_writing() {
                channel.enable_writing();
            }
        }
    }

    /// Requests a graceful shutdown: half-closes the write side once the
    /// output buffer has drained. A no-op unless `Connected`, in which
    /// case the state moves to `Disconnecting`.
    pub fn shutdown(self: &Arc<Self>) {
        let mut state = self.state.lock().unwrap();
        if *state == ConnState::Connected {
            *state = ConnState::Disconnecting;
            drop(state);
            let conn = Arc::clone(self);
            self.loop_handle
                .run_in_loop(Box::new(move || conn.shutdown_in_loop()));
        }
    }

    fn shutdown_in_loop(self: &Arc<Self>) {
        if !self.channel.lock().unwrap().is_writing() {
            if let Err(e) = socket::shutdown_write(&self.stream.lock().unwrap()) {
                tracing::error!(name = %self.name, error = %e, "failed to shut down write side");
            }
        }
    }

    /// Moves the connection to `Connected`, ties its channel to this
    /// connection's liveness, enables read interest, and invokes the
    /// connection callback. Must run on the owning loop.
    pub(crate) fn connect_established(self: &Arc<Self>) {
        {
            let mut state = self.state.lock().unwrap();
            debug_assert_eq!(*state, ConnState::Connecting);
            *state = ConnState::Connected;
        }
        {
            let mut channel = self.channel.lock().unwrap();
            channel.tie(self.self_weak.clone() as Weak<dyn std::any::Any + Send + Sync>);
            channel.enable_reading();
        }
        if let Some(cb) = self.callbacks.lock().unwrap().connection.clone() {
            cb(self);
        }
    }

    /// Tears the connection down: disables all interest, invokes the
    /// connection callback one last time if it hadn't already been
    /// disconnected, and fully removes the channel from the readiness
    /// source. Must run on the owning loop.
    pub(crate) fn connect_destroyed(self: &Arc<Self>) {
        {
            let mut state = self.state.lock().unwrap();
            if *state == ConnState::Connected {
                *state = ConnState::Disconnected;
                let mut channel = self.channel.lock().unwrap();
                channel.disable_all();
                drop(channel);
                drop(state);
                if let Some(cb) = self.callbacks.lock().unwrap().connection.clone() {
                    cb(self);
                }
            }
        }
        let mut channel = self.channel.lock().unwrap();
        channel.remove();
        self.loop_handle.free_token(channel.token());
        self.loop_handle.unregister_sink(channel.token());
    }

    fn handle_read(self: &Arc<Self>, receive_time: Instant) {
        let mut input = self.input_buffer.lock().unwrap();
        match input.read_fd(self.fd) {
            Ok(0) => {
                drop(input);
                self.handle_close();
            }
            Ok(_) => {
                if let Some(cb) = self.callbacks.lock().unwrap().message.clone() {
                    cb(self, &mut input, receive_time);
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => {
                tracing::error!(name = %self.name, error = %e, "TcpConnection::handle_read");
                drop(input);
                self.handle_error();
                self.handle_close();
            }
        }
    }

    fn handle_write(self: &Arc<Self>) {
        if !self.channel.lock().unwrap().is_writing() {
            tracing::error!(fd = self.fd, "connection is down, no more writing");
            return;
        }
        let mut output = self.output_buffer.lock().unwrap();
        match output.write_fd(self.fd) {
            Ok(n) => {
                output.retrieve(n);
                if output.readable_bytes() == 0 {
                    self.channel.lock().unwrap().disable_writing();
                    drop(output);
                    if let Some(cb) = self.callbacks.lock().unwrap().write_complete.clone() {
                        let conn = Arc::clone(self);
                        self.loop_handle
                            .queue_in_loop(Box::new(move || cb(&conn)));
                    }
                    if self.state() == ConnState::Disconnecting {
                        self.shutdown_in_loop();
                    }
                }
            }
            Err(e) => tracing::error!(name = %self.name, error = %e, "TcpConnection::handle_write"),
        }
    }

    /// Invoked on hangup (and, via `handle_read`, on EOF). Tears down
    /// interest, then hands off to the connection callback and the
    /// server's close callback (which removes this connection from its
    /// owning `TcpServer`).
    fn handle_close(self: &Arc<Self>) {
        tracing::info!(name = %self.name, fd = self.fd, "connection closed");
        *self.state.lock().unwrap() = ConnState::Disconnected;
        self.channel.lock().unwrap().disable_all();

        let connection_cb = self.callbacks.lock().unwrap().connection.clone();
        if let Some(cb) = connection_cb {
            cb(self);
        }
        let close_cb = self.callbacks.lock().unwrap().close.clone();
        if let Some(cb) = close_cb {
            cb(self);
        }
    }

    fn handle_error(self: &Arc<Self>) {
        let err = socket::socket_error(&self.stream.lock().unwrap());
        tracing::error!(name = %self.name, error = ?err, "TcpConnection::handle_error");
    }
}

impl EventSink for TcpConnection {
    fn handle_event(&self, event: &mio::event::Event, receive_time: Instant) {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop::EventLoop;
    use std::sync::atomic::AtomicBool;
    use std::thread;
    use std::time::Duration;

    fn connected_pair(loop_handle: &EventLoopHandle) -> (Arc<TcpConnection>, std::net::TcpStream) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = std::net::TcpStream::connect(addr).unwrap();
        let (server_stream, peer_addr) = listener.accept().unwrap();
        server_stream.set_nonblocking(true).unwrap();
        let local_addr = server_stream.local_addr().unwrap();
        let conn = TcpConnection::new(
            loop_handle.clone(),
            "test-1".to_string(),
            MioTcpStream::from_std(server_stream),
            local_addr,
            peer_addr,
        );
        (conn, client)
    }

    #[test]
    fn starts_connecting_and_moves_to_connected_on_establish() {
        let mut loop_ = EventLoop::new().unwrap();
        let handle = loop_.handle();
        let (conn, _client) = connected_pair(&handle);
        assert_eq!(conn.state(), ConnState::Connecting);
        conn.connect_established();
        assert_eq!(conn.state(), ConnState::Connected);
        handle.quit();
        loop_.run();
    }

    #[test]
    fn send_before_connected_is_a_no_op() {
        let mut loop_ = EventLoop::new().unwrap();
        let handle = loop_.handle();
        let (conn, _client) = connected_pair(&handle);
        conn.send(b"hello");
        assert_eq!(conn.output_buffer.lock().unwrap().readable_bytes(), 0);
        handle.quit();
        loop_.run();
    }

    #[test]
    fn high_water_mark_does_not_fire_on_reaching_the_mark_exactly() {
        let mut loop_ = EventLoop::new().unwrap();
        let handle = loop_.handle();
        let (conn, _client) = connected_pair(&handle);
        conn.connect_established();

        const MARK: usize = 1024;
        conn.output_buffer.lock().unwrap().append(&vec![0u8; MARK - 1]);
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();
        conn.set_high_water_mark_callback(
            Arc::new(move |_c, _n| {
                hits2.fetch_add(1, Ordering::SeqCst);
            }),
            MARK,
        );

        // Queues a task onto the loop's own pending queue; draining it
        // requires actually running one cycle of the loop, so a second
        // thread wakes it via `quit()` after a short delay.
        conn.send_in_loop(&[0u8; 1]);
        let handle2 = handle.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            handle2.quit();
        });
        loop_.run();

        assert_eq!(hits.load(Ordering::SeqCst), 0, "reaching the mark exactly must not fire");
    }

    #[test]
    fn high_water_mark_fires_once_on_crossing_above_the_mark() {
        let mut loop_ = EventLoop::new().unwrap();
        let handle = loop_.handle();
        let (conn, _client) = connected_pair(&handle);
        conn.connect_established();

        const MARK: usize = 1024;
        conn.output_buffer.lock().unwrap().append(&vec![0u8; MARK - 1]);
        let hits = Arc::new(AtomicUsize::new(0));
        let last_total = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();
        let last_total2 = last_total.clone();
        conn.set_high_water_mark_callback(
            Arc::new(move |_c, n| {
                hits2.fetch_add(1, Ordering::SeqCst);
                last_total2.store(n, Ordering::SeqCst);
            }),
            MARK,
        );

        conn.send_in_loop(&[0u8; 2]);
        let handle2 = handle.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            handle2.quit();
        });
        loop_.run();

        assert_eq!(hits.load(Ordering::SeqCst), 1, "crossing above the mark must fire exactly once");
        assert_eq!(last_total.load(Ordering::SeqCst), MARK + 1);
    }

    #[test]
    fn connect_destroyed_is_idempotent_once_disconnected() {
        let mut loop_ = EventLoop::new().unwrap();
        let handle = loop_.handle();
        let (conn, _client) = connected_pair(&handle);
        conn.connect_established();
        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = fired.clone();
        conn.set_connection_callback(Arc::new(move |_c| {
            fired2.store(true, Ordering::SeqCst);
        }));
        conn.connect_destroyed();
        assert!(fired.load(Ordering::SeqCst));
        assert_eq!(conn.state(), ConnState::Disconnected);
        // A second teardown must not invoke the callback again.
        fired.store(false, Ordering::SeqCst);
        conn.connect_destroyed();
        assert!(!fired.load(Ordering::SeqCst));
        handle.quit();
        loop_.run();
    }
}
