pub mod concurrent;
pub mod config;
pub mod http;
pub mod lifecycle;
pub mod logging;
pub mod types;

#[cfg(test)]
pub mod test_utils;

pub use config::{CoreConfig, Limits};
pub use types::error::{CoreError, Result};
