//! Configuration module
//!
//! Loads API credentials from the `.env` file.

mod env;
mod value;

pub use env::*;
pub use value::*;
