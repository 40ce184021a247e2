//! Network backend: records kept on a remote server reached through
//! [`crate::wire`]

pub mod codec;
pub mod store;

pub use store::NetworkStore;
