//! # Network Abstraction Layer
//!
//! Traits that abstract over async TCP I/O, so the transport layer can be
//! driven by real tokio sockets in production and by alternative
//! implementations in tests.
//!
//! | Trait | Purpose | Production impl |
//! |-------|---------|-----------------|
//! | [`TcpStream`] | connect, read, write | `tokio::net::TcpStream` |
//! | [`TcpListener`] | accept connections | `tokio::net::TcpListener` |
//!
//! User code normally never touches these: [`Session`](crate::Session) and
//! friends default their generic parameters to the tokio types.

use std::future::Future;
use std::io;
use std::net::SocketAddr;

mod tokio_impl;

/// Async TCP stream abstraction.
pub trait TcpStream: Send + Sized + 'static {
    /// The listener type that produces this stream.
    type Listener: TcpListener<Stream = Self>;

    /// Connect to the given address.
    fn connect(addr: SocketAddr) -> impl Future<Output = io::Result<Self>> + Send;

    /// Read data into the buffer, returning 0 at EOF.
    fn read(&mut self, buf: &mut [u8]) -> impl Future<Output = io::Result<usize>> + Send;

    /// Write the whole buffer.
    fn write_all(&mut self, buf: &[u8]) -> impl Future<Output = io::Result<()>> + Send;

    /// Get the local address.
    fn local_addr(&self) -> io::Result<SocketAddr>;

    /// Get the peer address.
    fn peer_addr(&self) -> io::Result<SocketAddr>;
}

/// Async TCP listener abstraction.
pub trait TcpListener: Send + Sync + Sized + 'static {
    /// The stream type produced when accepting connections.
    type Stream: TcpStream<Listener = Self>;

    /// Bind to the given address.
    fn bind(addr: SocketAddr) -> impl Future<Output = io::Result<Self>> + Send;

    /// Accept a new connection.
    fn accept(&self) -> impl Future<Output = io::Result<(Self::Stream, SocketAddr)>> + Send;

    /// Get the local address.
    fn local_addr(&self) -> io::Result<SocketAddr>;
}
