pub mod error;
pub mod logging;
pub mod platform;

pub use error::{Result, VboxError};
