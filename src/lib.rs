//! A reactor-pattern TCP server core: one acceptor loop, *N* worker event
//! loops, each pinned to its own OS thread -- the architecture popularized
//! by Chen Shuo's `muduo`.
//!
//! ```text
//!           Acceptor (main loop)
//!                |
//!      round-robin dispatch of accepted connections
//!                |
//!   worker loop 0   worker loop 1   ...   worker loop N-1
//!     (epoll)          (epoll)                (epoll)
//! ```
//!
//! Build a server with [`TcpServer`], wire up [`TcpConnection`] callbacks,
//! and call `start()`. See `tests/echo.rs` for a complete example.
#![cfg(unix)]

pub mod acceptor;
pub mod buffer;
pub mod channel;
pub mod error;
pub mod event_loop;
pub mod event_loop_thread;
pub mod event_loop_thread_pool;
pub mod socket;
pub mod tcp_connection;
pub mod tcp_server;

pub use acceptor::Acceptor;
pub use buffer::Buffer;
pub use channel::Channel;
pub use error::ReactorError;
pub use event_loop::{EventLoop, EventLoopHandle};
pub use event_loop_thread::EventLoopThread;
pub use event_loop_thread_pool::{EventLoopThreadPool, PoolInitCallback};
pub use tcp_connection::{
    ConnState, ConnectionCallback, HighWaterMarkCallback, MessageCallback, TcpConnection,
    WriteCompleteCallback,
};
pub use tcp_server::{ReusePortOption, TcpServer};
