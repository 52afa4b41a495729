use crate::config::Config;
use crate::error::{Error, Result};
use hf_hub::api::sync::{Api, ApiBuilder};
use std::path::{Path, PathBuf};

/// YOLOv8 size variants published as safetensors weights.
pub const VARIANTS: [&str; 5] = ["n", "s", "m", "l", "x"];

pub struct WeightDownloader {
    api: Api,
    hub_repo: String,
}

impl WeightDownloader {
    pub fn new(config: &Config) -> Result<Self> {
        let api = ApiBuilder::new()
            .with_cache_dir(config.models_dir.clone())
            .build()
            .map_err(|e| Error::DownloadFailed(e.to_string()))?;

        Ok(Self {
            api,
            hub_repo: config.detect.hub_repo.clone(),
        })
    }

    /// Downloads `yolov8{variant}.safetensors`, reusing the local cache when
    /// the file is already present.
    pub fn fetch(&self, variant: &str) -> Result<PathBuf> {
        if !VARIANTS.contains(&variant) {
            return Err(Error::InvalidInput(format!(
                "Unknown YOLOv8 variant '{}', expected one of {:?}",
                variant, VARIANTS
            )));
        }

        let file_name = format!("yolov8{}.safetensors", variant);
        tracing::info!("Fetching {} from {}", file_name, self.hub_repo);

        let repo = self.api.model(self.hub_repo.clone());
        let path = repo
            .get(&file_name)
            .map_err(|e| Error::DownloadFailed(format!("Could not fetch {}: {}", file_name, e)))?;

        tracing::info!("Weights available at {:?}", path);
        Ok(path)
    }
}

/// Reads the variant letter out of a weight file name such as `yolov8s.pt`
/// or `traffic-yolov8m.safetensors`.
pub fn variant_from_path(path: &Path) -> Option<&'static str> {
    let stem = path.file_stem()?.to_str()?.to_ascii_lowercase();
    let idx = stem.find("yolov8")?;
    let letter = stem[idx + "yolov8".len()..].chars().next()?;
    VARIANTS.iter().copied().find(|v| v.starts_with(letter))
}

/// A stock weight name is a bare `yolov8<variant>` stem with an optional
/// `.pt` or `.safetensors` extension and no directory component.
pub fn stock_variant(model_path: &str) -> Option<&'static str> {
    let path = Path::new(model_path);
    if path.parent().is_some_and(|p| !p.as_os_str().is_empty()) {
        return None;
    }

    let ext_ok = match path.extension().and_then(|e| e.to_str()) {
        None => true,
        Some(ext) => ext == "pt" || ext == "safetensors",
    };
    let stem = path.file_stem()?.to_str()?;

    if ext_ok && stem.len() == "yolov8".len() + 1 && stem.starts_with("yolov8") {
        variant_from_path(path)
    } else {
        None
    }
}
