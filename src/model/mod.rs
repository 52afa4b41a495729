pub mod downloader;
pub mod registry;

pub use downloader::WeightDownloader;
pub use registry::{DetectionModel, ModelInfo, ModelLoader, ModelRegistry, Prediction, RegisteredModel};
