pub mod error;
pub mod event;

pub use error::LogmillError;
pub use event::{Context, LogEvent};
