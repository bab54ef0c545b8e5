//! Local control/query channel between the daemon and its clients.

pub mod client;
pub mod handler;
pub mod protocol;
pub mod server;

pub use client::{ClientError, DaemonClient};
pub use handler::RequestHandler;
pub use protocol::{DaemonStatus, EncodedSnapshot, ErrorCode, Request, Response};
pub use server::{default_socket_path, IpcServer};
