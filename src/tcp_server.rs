//! Composes an `Acceptor` and an `EventLoopThreadPool` into a complete TCP
//! server: accepts on the main loop, hands each connection to a worker,
//! and owns the connection map. Modeled on muduo's `TcpServer`.
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::acceptor::Acceptor;
use crate::error::ReactorError;
use crate::event_loop::EventLoopHandle;
use crate::event_loop_thread_pool::{EventLoopThreadPool, PoolInitCallback};
use crate::tcp_connection::{
    ConnectionCallback, HighWaterMarkCallback, MessageCallback, TcpConnection,
    WriteCompleteCallback, DEFAULT_HIGH_WATER_MARK,
};

/// Whether the listening socket sets `SO_REUSEPORT` in addition to the
/// unconditional `SO_REUSEADDR`, matching muduo's `TcpServer::Option`
/// (`kNoReusePort`/`kReusePort`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReusePortOption {
    /// Only `SO_REUSEADDR` is set.
    NoReusePort,
    /// `SO_REUSEPORT` is also set, allowing multiple processes to share
    /// the listen address.
    ReusePort,
}

#[derive(Default)]
struct ServerCallbacks {
    connection: Option<ConnectionCallback>,
    message: Option<MessageCallback>,
    write_complete: Option<WriteCompleteCallback>,
    high_water_mark: Option<(HighWaterMarkCallback, usize)>,
}

/// A complete TCP server: one acceptor on the main loop, a pool of worker
/// loops each connection is pinned to, and the live connection map.
pub struct TcpServer {
    name: String,
    loop_handle: EventLoopHandle,
    listen_addr: SocketAddr,
    acceptor: Arc<Acceptor>,
    thread_pool: Mutex<Option<EventLoopThreadPool>>,
    num_threads: Mutex<usize>,
    thread_init: Mutex<Option<PoolInitCallback>>,
    connections: Mutex<HashMap<String, Arc<TcpConnection>>>,
    next_conn_id: AtomicUsize,
    started: AtomicBool,
    callbacks: Mutex<ServerCallbacks>,
}

impl TcpServer {
    /// Binds the listening socket for `addr` on `main_loop` (the loop that
    /// will run the acceptor) and builds a server ready to be configured
    /// with callbacks before `start()`.
    pub fn new(
        main_loop: EventLoopHandle,
        name: impl Into<String>,
        addr: SocketAddr,
        option: ReusePortOption,
    ) -> Result<Arc<Self>, ReactorError> {
        let acceptor = Acceptor::new(&main_loop, addr, option == ReusePortOption::ReusePort)?;
        let listen_addr = acceptor.local_addr().unwrap_or(addr);
        let server = Arc::new(TcpServer {
            name: name.into(),
            loop_handle: main_loop,
            listen_addr,
            acceptor,
            thread_pool: Mutex::new(None),
            num_threads: Mutex::new(0),
            thread_init: Mutex::new(None),
            connections: Mutex::new(HashMap::new()),
            next_conn_id: AtomicUsize::new(1),
            started: AtomicBool::new(false),
            callbacks: Mutex::new(ServerCallbacks::default()),
        });

        let weak = Arc::downgrade(&server);
        server
            .acceptor
            .set_new_connection_callback(Box::new(move |stream, peer_addr| {
                if let Some(server) = weak.upgrade() {
                    server.new_connection(stream, peer_addr);
                }
            }));

        Ok(server)
    }

    /// The server's configured name, used as a prefix for every
    /// connection's unique name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The address the acceptor is bound to.
    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    /// The number of connections currently tracked in the server's
    /// registry -- those that have completed `connect_established` and
    /// not yet completed `remove_connection_in_loop` (invariant §3/§8-5).
    pub fn connection_count(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    /// Sets the worker pool size. Must be called before `start()`; has no
    /// effect afterward. `0` (the default) means every connection runs on
    /// the main loop.
    pub fn set_thread_num(&self, n: usize) {
        *self.num_threads.lock().unwrap() = n;
    }

    /// Sets a callback run once on each worker thread, right after its
    /// `EventLoop` is constructed and before it starts dispatching events.
    /// Must be called before `start()`.
    pub fn set_thread_init_callback(&self, cb: PoolInitCallback) {
        *self.thread_init.lock().unwrap() = Some(cb);
    }

    /// Sets the callback invoked whenever a connection is established or
    /// about to be torn down. Applies to connections accepted after this
    /// call.
    pub fn set_connection_callback(&self, cb: ConnectionCallback) {
        self.callbacks.lock().unwrap().connection = Some(cb);
    }

    /// Sets the callback invoked whenever bytes arrive on any connection.
    pub fn set_message_callback(&self, cb: MessageCallback) {
        self.callbacks.lock().unwrap().message = Some(cb);
    }

    /// Sets the callback invoked once an output buffer fully drains after
    /// a partial write.
    pub fn set_write_complete_callback(&self, cb: WriteCompleteCallback) {
        self.callbacks.lock().unwrap().write_complete = Some(cb);
    }

    /// Sets the callback invoked when a connection's output buffer grows
    /// past `mark` bytes, and the mark itself (applied to every connection
    /// accepted after this call; the default is 64 MiB).
    pub fn set_high_water_mark_callback(&self, cb: HighWaterMarkCallback, mark: usize) {
        self.callbacks.lock().unwrap().high_water_mark = Some((cb, mark));
    }

    /// Starts the server: launches the worker pool (sized by
    /// `set_thread_num`) and begins listening. Idempotent -- only the
    /// first call has any effect.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let n = *self.num_threads.lock().unwrap();
        let init_cb = self.thread_init.lock().unwrap().clone();
        let pool = EventLoopThreadPool::new(self.loop_handle.clone(), n, init_cb);
        *self.thread_pool.lock().unwrap() = Some(pool);

        let acceptor = Arc::clone(&self.acceptor);
        self.loop_handle.run_in_loop(Box::new(move || acceptor.listen()));
    }

    fn new_connection(self: &Arc<Self>, stream: mio::net::TcpStream, peer_addr: SocketAddr) {
        let worker = self
            .thread_pool
            .lock()
            .unwrap()
            .as_ref()
            .expect("new_connection called before start()")
            .get_next_loop();

        let conn_id = self.next_conn_id.fetch_add(1, Ordering::SeqCst);
        let name = format!("{}-{}#{}", self.name, self.listen_addr, conn_id);
        let local_addr = stream.local_addr().unwrap_or(self.listen_addr);

        tracing::info!(name = %name, peer = %peer_addr, "new connection");

        let conn = TcpConnection::new(worker.clone(), name.clone(), stream, local_addr, peer_addr);

        {
            let cbs = self.callbacks.lock().unwrap();
            if let Some(cb) = &cbs.connection {
                conn.set_connection_callback(cb.clone());
            }
            if let Some(cb) = &cbs.message {
                conn.set_message_callback(cb.clone());
            }
            if let Some(cb) = &cbs.write_complete {
                conn.set_write_complete_callback(cb.clone());
            }
            if let Some((cb, mark)) = &cbs.high_water_mark {
                conn.set_high_water_mark_callback(cb.clone(), *mark);
            } else {
                conn.set_high_water_mark_callback(
                    Arc::new(|_, _| {}),
                    DEFAULT_HIGH_WATER_MARK,
                );
            }
        }

        let server_weak = Arc::downgrade(self);
        conn.set_close_callback(Arc::new(move |c: &Arc<TcpConnection>| {
            if let Some(server) = server_weak.upgrade() {
                server.remove_connection(c);
            }
        }));

        self.connections
            .lock()
            .unwrap()
            .insert(name, Arc::clone(&conn));

        worker.run_in_loop(Box::new(move || conn.connect_established()));
    }

    /// Bounces connection removal to the main loop, matching muduo's
    /// `removeConnection` always running on the loop that owns the
    /// connection map (not the worker that noticed the close).
    pub(crate) fn remove_connection(self: &Arc<Self>, conn: &Arc<TcpConnection>) {
        let server = Arc::clone(self);
        let conn = Arc::clone(conn);
        self.loop_handle
            .run_in_loop(Box::new(move || server.remove_connection_in_loop(&conn)));
    }

    fn remove_connection_in_loop(self: &Arc<Self>, conn: &Arc<TcpConnection>) {
        tracing::info!(name = conn.name(), "removing connection");
        self.connections.lock().unwrap().remove(conn.name());
        let conn2 = Arc::clone(conn);
        conn.loop_handle()
            .run_in_loop(Box::new(move || conn2.connect_destroyed()));
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        for (_, conn) in self.connections.lock().unwrap().drain() {
            let c = Arc::clone(&conn);
            conn.loop_handle()
                .run_in_loop(Box::new(move || c.connect_destroyed()));
        }
        if let Some(mut pool) = self.thread_pool.lock().unwrap().take() {
            pool.join_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop::EventLoop;
    use std::net::TcpStream;
    use std::sync::atomic::AtomicUsize as StdAtomicUsize;
    use std::time::Duration;

    #[test]
    fn start_is_idempotent_and_accepts_a_connection() {
        let mut main_loop = EventLoop::new().unwrap();
        let handle = main_loop.handle();
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let server = TcpServer::new(handle.clone(), "echo", addr, ReusePortOption::NoReusePort).unwrap();

        let connected = Arc::new(StdAtomicUsize::new(0));
        let connected2 = connected.clone();
        server.set_connection_callback(Arc::new(move |conn| {
            if conn.connected() {
                connected2.fetch_add(1, Ordering::SeqCst);
            }
        }));

        server.start();
        server.start(); // second call must be a no-op

        let listen_addr = server.listen_addr();
        std::thread::spawn(move || {
            let _client = TcpStream::connect(listen_addr).unwrap();
            std::thread::sleep(Duration::from_millis(200));
        });

        let handle2 = handle.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(300));
            handle2.quit();
        });
        main_loop.run();

        assert!(connected.load(Ordering::SeqCst) >= 1);
    }
}
