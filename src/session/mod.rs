//! Connected streaming clients

pub mod store;

pub use store::{ClientSession, SessionStore, UNKNOWN_CLIENT};
