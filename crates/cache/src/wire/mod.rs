//! Client for the inline text protocol spoken by the network backend
//!
//! Requests go out as single newline-terminated lines ([`Command`]); replies
//! come back in the marker grammar decoded by [`reply::parse`]. A
//! [`WireClient`] owns one lazily established [`Connection`].

pub mod client;
pub mod command;
pub mod connection;
pub mod reply;

pub use client::{format_error, WireClient};
pub use command::{sanitize, Command, EMPTY_PLACEHOLDER};
pub use connection::{Connection, Wait};
pub use reply::{ParseError, Reply};
