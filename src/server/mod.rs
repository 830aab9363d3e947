//! Server side of TSQ
//!
//! The [`Responder`] turns one request into one response and is shared by
//! every transport. The listener runs it behind TLS.

mod listener;
mod responder;

pub use self::listener::{serve_connection, ConnectionSummary, Server};
pub use self::responder::Responder;
