pub mod cli;
pub mod config;
pub mod detector;
pub mod error;
pub mod model;
pub mod server;

pub use config::Config;
pub use error::{Error, Result};
pub use model::{DetectionModel, ModelLoader, ModelRegistry};
