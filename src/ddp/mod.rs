//! Client side of the chat server's DDP streaming protocol.

pub mod connection;
pub mod protocol;
pub mod session;
pub mod supervisor;

pub use supervisor::{supervise, BackoffPolicy, WsConnector};
