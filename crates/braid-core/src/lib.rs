pub mod config;
pub mod error;
pub mod event;
pub mod traits;
pub mod types;

pub use config::AppConfig;
pub use error::{BraidError, ErrorKind, Result};
pub use event::{event_channel, EventSender, EventStream, RunEvent};
pub use types::*;
