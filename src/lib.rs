pub mod config;
pub mod echonetlite;
pub mod error;
pub mod meter;
pub mod serial;
pub mod session;
pub mod skstack;

pub use config::*;
pub use error::{Error, Result, SkCommandError};
pub use meter::*;
