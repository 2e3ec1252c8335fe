//! The tidepool daemon: a hub thread plus the HTTP long-poll server.

mod error;
pub mod paths;
mod runtime;
pub mod server;

pub use error::DaemonError;
pub use runtime::{bind, run, serve, start_blocking, ServeOptions};
pub use server::{router, Acknowledgement, ApiError};
