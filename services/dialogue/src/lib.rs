pub mod config;
pub mod game;

pub use config::{Config, ConfigError};
pub use game::{Dialogue, DialogueSummary};
