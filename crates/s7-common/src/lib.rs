#![doc = "Common types shared across the S7 adapter workspace."]

pub mod config;
pub mod error;
pub mod state;
pub mod tag;

pub use config::*;
pub use error::*;
pub use state::*;
pub use tag::*;
