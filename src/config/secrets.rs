//! Secret handling utilities.
//!
//! Re-exports secrecy types used for the database URL and broker passcode.

pub use secrecy::{ExposeSecret, SecretString};
