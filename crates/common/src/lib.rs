//! Common types shared by the K2Think proxy crates

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::Secret;
