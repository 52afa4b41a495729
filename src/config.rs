use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Detection defaults applied to every model the loader builds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectConfig {
	pub confidence_threshold: f32,
	pub iou_threshold: f32,
	pub max_detections: usize,
	/// Class count used when the weights do not carry a classification head.
	pub num_classes: usize,
	/// Variant letter used when neither the weights nor the file name reveal it.
	pub default_variant: String,
	pub hub_repo: String,
}

impl Default for DetectConfig {
	fn default() -> Self {
		Self {
			confidence_threshold: 0.25,
			iou_threshold: 0.45,
			max_detections: 300,
			num_classes: 80,
			default_variant: "n".to_string(),
			hub_repo: "lmz/candle-yolo-v8".to_string(),
		}
	}
}

impl DetectConfig {
	pub fn validate(&self) -> crate::error::Result<()> {
		if !(0.0..=1.0).contains(&self.confidence_threshold) {
			return Err(crate::error::Error::ConfigError(format!(
				"confidence_threshold must be within [0, 1], got {}",
				self.confidence_threshold
			)));
		}
		if !(0.0..=1.0).contains(&self.iou_threshold) {
			return Err(crate::error::Error::ConfigError(format!(
				"iou_threshold must be within [0, 1], got {}",
				self.iou_threshold
			)));
		}
		if !crate::model::downloader::VARIANTS.contains(&self.default_variant.as_str()) {
			return Err(crate::error::Error::ConfigError(format!(
				"default_variant must be one of {:?}, got '{}'",
				crate::model::downloader::VARIANTS,
				self.default_variant
			)));
		}
		if self.num_classes == 0 {
			return Err(crate::error::Error::ConfigError("num_classes must be positive".to_string()));
		}
		Ok(())
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
	pub data_dir: PathBuf,
	pub models_dir: PathBuf,
	pub config_path: PathBuf,
	pub detect: DetectConfig,
}

impl Config {
	pub fn new() -> crate::error::Result<Self> {
		let project_dirs = ProjectDirs::from("", "", "spotter")
			.ok_or_else(|| crate::error::Error::ConfigError("Could not determine config directory".to_string()))?;

		Self::with_data_dir(project_dirs.data_dir().to_path_buf())
	}

	pub fn from_env() -> crate::error::Result<Self> {
		if let Ok(data_dir) = std::env::var("SPOTTER_DATA_DIR") {
			Self::with_data_dir(PathBuf::from(data_dir))
		} else {
			Self::new()
		}
	}

	fn with_data_dir(data_dir: PathBuf) -> crate::error::Result<Self> {
		let models_dir = data_dir.join("models");
		let config_path = data_dir.join("config.toml");

		std::fs::create_dir_all(&data_dir)?;
		std::fs::create_dir_all(&models_dir)?;

		let detect = load_detect_config(&config_path)?;

		Ok(Self {
			data_dir,
			models_dir,
			config_path,
			detect,
		})
	}
}

fn load_detect_config(path: &Path) -> crate::error::Result<DetectConfig> {
	if !path.exists() {
		return Ok(DetectConfig::default());
	}

	tracing::debug!("Reading detection settings from {:?}", path);
	let content = std::fs::read_to_string(path)?;
	parse_detect_config(&content)
}

pub fn parse_detect_config(content: &str) -> crate::error::Result<DetectConfig> {
	let detect: DetectConfig = toml::from_str(content)?;
	detect.validate()?;
	Ok(detect)
}
