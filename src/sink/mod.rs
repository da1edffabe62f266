//! TCP Fan-out Sink (§4.4).

pub mod client_connection;
pub mod fanout;

pub use client_connection::ClientConnection;
pub use fanout::FanoutSink;
