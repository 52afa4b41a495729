pub mod bbox;
pub mod coco;
pub mod network;

use crate::config::{Config, DetectConfig};
use crate::error::{Error, Result};
use crate::model::downloader::{stock_variant, variant_from_path};
use crate::model::{DetectionModel, ModelLoader, WeightDownloader};
use bbox::{non_maximum_suppression, BoundingBox, Candidate};
use candle_core::safetensors::MmapedSafetensors;
use candle_core::{DType, Device, Module, Tensor};
use candle_nn::VarBuilder;
use image::{imageops::FilterType, DynamicImage};
use network::{Multiples, YoloV8, CLASS_WEIGHT, STEM_WEIGHT};
use serde::Serialize;
use std::path::{Path, PathBuf};

/// Longest image side fed to the network.
const INPUT_SIZE: u32 = 640;
/// Input sides must be a multiple of the coarsest stride.
const STRIDE_ALIGN: u32 = 32;

pub fn parse_device(device_str: &str) -> Result<Device> {
    match device_str {
        "cpu" => Ok(Device::Cpu),
        s if s.starts_with("cuda") => {
            let parts: Vec<&str> = s.split(':').collect();
            let ordinal = if parts.len() > 1 {
                parts[1]
                    .parse::<usize>()
                    .map_err(|_| Error::InvalidInput(format!("Invalid CUDA device: {}", s)))?
            } else {
                0
            };
            Device::new_cuda(ordinal).map_err(|e| {
                Error::ConfigError(format!("Failed to initialize CUDA device: {}", e))
            })
        }
        _ => Err(Error::InvalidInput(format!(
            "Unknown device: {}",
            device_str
        ))),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Detection {
    pub class_id: usize,
    pub label: String,
    pub confidence: f32,
    pub bbox: BoundingBox,
}

#[derive(Debug, Clone, Serialize)]
pub struct Predictions {
    pub image: String,
    pub width: u32,
    pub height: u32,
    pub detections: Vec<Detection>,
}

/// Builds YOLOv8 models from safetensors weights, downloading stock
/// variants on demand.
pub struct YoloLoader {
    device: Device,
    settings: DetectConfig,
    downloader: Option<WeightDownloader>,
}

impl YoloLoader {
    pub fn new(config: &Config, device: Device) -> Result<Self> {
        config.detect.validate()?;
        Ok(Self {
            device,
            settings: config.detect.clone(),
            downloader: Some(WeightDownloader::new(config)?),
        })
    }

    /// A loader that only accepts local weight files.
    pub fn offline(settings: DetectConfig, device: Device) -> Self {
        Self {
            device,
            settings,
            downloader: None,
        }
    }

    fn resolve_weights(&self, model_path: &str) -> Result<PathBuf> {
        let path = Path::new(model_path);

        if path.exists() {
            return match path.extension().and_then(|e| e.to_str()) {
                Some("safetensors") => Ok(path.to_path_buf()),
                _ => Err(Error::ModelLoadFailed(format!(
                    "{} is not a safetensors weight file",
                    model_path
                ))),
            };
        }

        if let Some(variant) = stock_variant(model_path) {
            let downloader = self.downloader.as_ref().ok_or_else(|| {
                Error::ModelLoadFailed(format!(
                    "{} is not available locally and downloads are disabled",
                    model_path
                ))
            })?;
            return downloader.fetch(variant);
        }

        Err(Error::ModelLoadFailed(format!("No such model file: {}", model_path)))
    }
}

/// Network layout recorded in a weight file. Either field is `None` when the
/// corresponding tensor is absent or has an unexpected shape.
#[derive(Debug, Default, PartialEq)]
pub struct WeightLayout {
    pub variant: Option<&'static str>,
    pub num_classes: Option<usize>,
}

pub fn inspect_weights(path: &Path) -> Result<WeightLayout> {
    // Safety: read-only mapping, dropped before this function returns.
    let tensors = unsafe { MmapedSafetensors::new(path) }
        .map_err(|e| Error::ModelLoadFailed(format!("Failed to map {:?}: {}", path, e)))?;

    let leading_dim = |name: &str| {
        tensors
            .get(name)
            .ok()
            .and_then(|view| view.shape().first().copied())
    };

    Ok(WeightLayout {
        variant: leading_dim(STEM_WEIGHT).and_then(Multiples::variant_for_stem_channels),
        num_classes: leading_dim(CLASS_WEIGHT).filter(|&n| n > 0),
    })
}

impl ModelLoader for YoloLoader {
    type Model = YoloModel;

    fn load(&self, model_path: &str) -> Result<YoloModel> {
        let weights = self.resolve_weights(model_path)?;
        let layout = inspect_weights(&weights)?;

        // The weights are authoritative; names and config only fill gaps.
        let variant = match layout
            .variant
            .or_else(|| variant_from_path(Path::new(model_path)))
            .or_else(|| variant_from_path(&weights))
        {
            Some(v) => v,
            None => self.settings.default_variant.as_str(),
        };
        let num_classes = layout.num_classes.unwrap_or(self.settings.num_classes);
        let multiples = Multiples::for_variant(variant).ok_or_else(|| {
            Error::ConfigError(format!("Unknown YOLOv8 variant '{}'", variant))
        })?;

        tracing::info!("Loading YOLOv8{} weights from {:?}", variant, weights);

        // Safety: the weight file is memory-mapped read-only and must not be
        // modified while the model is alive.
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[weights.as_path()], DType::F32, &self.device)
                .map_err(|e| Error::ModelLoadFailed(format!("Failed to map {:?}: {}", weights, e)))?
        };

        let network = YoloV8::load(vb, multiples, num_classes)
            .map_err(|e| Error::ModelLoadFailed(format!("Failed to build network: {}", e)))?;

        tracing::info!("Model loaded successfully");
        tracing::info!("  Variant: yolov8{}", variant);
        tracing::info!("  Classes: {}", num_classes);
        tracing::info!("  Device: {:?}", self.device);

        Ok(YoloModel {
            network,
            device: self.device.clone(),
            settings: self.settings.clone(),
            weights,
            variant: variant.to_string(),
            num_classes,
        })
    }
}

#[derive(Debug)]
pub struct YoloModel {
    network: YoloV8,
    device: Device,
    settings: DetectConfig,
    weights: PathBuf,
    variant: String,
    num_classes: usize,
}

impl YoloModel {
    pub fn weights(&self) -> &Path {
        &self.weights
    }

    pub fn variant(&self) -> &str {
        &self.variant
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    fn forward(&self, image: &DynamicImage, width: u32, height: u32) -> candle_core::Result<Vec<Vec<f32>>> {
        let resized = image.resize_exact(width, height, FilterType::CatmullRom);
        let data = resized.to_rgb8().into_raw();
        let input = Tensor::from_vec(data, (height as usize, width as usize, 3), &self.device)?
            .permute((2, 0, 1))?;
        let input = (input.unsqueeze(0)?.to_dtype(DType::F32)? * (1. / 255.))?;

        // (4 + classes, anchors) -> one row per anchor
        self.network
            .forward(&input)?
            .squeeze(0)?
            .to_device(&Device::Cpu)?
            .t()?
            .contiguous()?
            .to_vec2::<f32>()
    }
}

impl DetectionModel for YoloModel {
    type Output = Predictions;

    fn predict(&self, img_path: &str) -> Result<Predictions> {
        let image = image::open(img_path)?;
        let (width, height) = (image.width(), image.height());
        let (input_w, input_h) = input_size(width, height)?;

        tracing::debug!(
            "Running inference on {} ({}x{} -> {}x{})",
            img_path,
            width,
            height,
            input_w,
            input_h
        );

        let rows = self
            .forward(&image, input_w, input_h)
            .map_err(|e| Error::PredictionFailed(e.to_string()))?;

        let candidates = decode_rows(&rows, self.settings.confidence_threshold);
        let kept = non_maximum_suppression(candidates, self.settings.iou_threshold);

        let sx = width as f32 / input_w as f32;
        let sy = height as f32 / input_h as f32;
        let detections: Vec<Detection> = kept
            .into_iter()
            .take(self.settings.max_detections)
            .map(|c| Detection {
                class_id: c.class_id,
                label: label_for(c.class_id, self.num_classes),
                confidence: c.confidence,
                bbox: c.bbox.scale(sx, sy).clamp(width as f32, height as f32),
            })
            .collect();

        tracing::debug!("{} detections in {}", detections.len(), img_path);

        Ok(Predictions {
            image: img_path.to_string(),
            width,
            height,
            detections,
        })
    }
}

/// Network input size for an image: the long side becomes 640 and the short
/// side is scaled proportionally then rounded down to a multiple of 32.
pub fn input_size(width: u32, height: u32) -> Result<(u32, u32)> {
    if width == 0 || height == 0 {
        return Err(Error::InvalidInput(format!("Empty image ({}x{})", width, height)));
    }

    let align = |side: u64| ((side as u32 / STRIDE_ALIGN) * STRIDE_ALIGN).max(STRIDE_ALIGN);
    if width < height {
        let w = width as u64 * INPUT_SIZE as u64 / height as u64;
        Ok((align(w), INPUT_SIZE))
    } else {
        let h = height as u64 * INPUT_SIZE as u64 / width as u64;
        Ok((INPUT_SIZE, align(h)))
    }
}

/// Turns raw head rows `[cx, cy, w, h, score_0, .., score_n]` into candidates
/// whose best class score is above `threshold`.
pub fn decode_rows(rows: &[Vec<f32>], threshold: f32) -> Vec<Candidate> {
    rows.iter()
        .filter(|row| row.len() > 4)
        .filter_map(|row| {
            let (class_id, score) = row[4..]
                .iter()
                .copied()
                .enumerate()
                .max_by(|a, b| a.1.total_cmp(&b.1))?;
            (score > threshold).then(|| Candidate {
                bbox: BoundingBox::from_center(row[0], row[1], row[2], row[3]),
                class_id,
                confidence: score,
            })
        })
        .collect()
}

pub fn label_for(class_id: usize, num_classes: usize) -> String {
    if num_classes == coco::NAMES.len() {
        if let Some(name) = coco::NAMES.get(class_id) {
            return name.to_string();
        }
    }
    format!("class_{}", class_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ModelRegistry;
    use candle_nn::VarMap;

    fn scratch_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("spotter-{}-{}", std::process::id(), tag));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    /// Writes a randomly initialised network to `dir/file` the way a
    /// training run would export it.
    fn save_network(dir: &Path, file: &str, variant: &str, num_classes: usize) -> PathBuf {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        YoloV8::load(vb, Multiples::for_variant(variant).unwrap(), num_classes).unwrap();
        let path = dir.join(file);
        varmap.save(&path).unwrap();
        path
    }

    fn write_png(dir: &Path, width: u32, height: u32) -> PathBuf {
        let path = dir.join(format!("gray-{}x{}.png", width, height));
        image::RgbImage::from_pixel(width, height, image::Rgb([127, 127, 127]))
            .save(&path)
            .unwrap();
        path
    }

    fn zero_model(max_detections: usize) -> YoloModel {
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        let network = YoloV8::load(vb, Multiples::for_variant("n").unwrap(), 80).unwrap();
        YoloModel {
            network,
            device: Device::Cpu,
            settings: DetectConfig {
                max_detections,
                ..DetectConfig::default()
            },
            weights: PathBuf::new(),
            variant: "n".to_string(),
            num_classes: 80,
        }
    }

    #[test]
    fn landscape_images_keep_width_640() {
        assert_eq!(input_size(1280, 720).unwrap(), (640, 352));
        assert_eq!(input_size(640, 640).unwrap(), (640, 640));
    }

    #[test]
    fn portrait_images_keep_height_640() {
        assert_eq!(input_size(480, 640).unwrap(), (480, 640));
        assert_eq!(input_size(500, 1000).unwrap(), (320, 640));
    }

    #[test]
    fn extreme_aspect_ratio_keeps_one_stride() {
        assert_eq!(input_size(4000, 10).unwrap(), (640, 32));
    }

    #[test]
    fn empty_image_is_rejected() {
        assert!(matches!(input_size(0, 10), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn decode_keeps_rows_above_threshold_with_best_class() {
        let rows = vec![
            vec![50., 50., 20., 10., 0.1, 0.8, 0.3],
            vec![10., 10., 4., 4., 0.2, 0.1, 0.05],
        ];

        let candidates = decode_rows(&rows, 0.25);

        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].class_id, 1);
        assert_eq!(candidates[0].confidence, 0.8);
        assert_eq!(
            candidates[0].bbox,
            BoundingBox { xmin: 40., ymin: 45., xmax: 60., ymax: 55. }
        );
    }

    #[test]
    fn decode_skips_rows_without_scores() {
        assert!(decode_rows(&[vec![1., 2., 3., 4.]], 0.0).is_empty());
    }

    #[test]
    fn labels_use_coco_names_for_80_classes() {
        assert_eq!(label_for(0, 80), "person");
        assert_eq!(label_for(79, 80), "toothbrush");
        assert_eq!(label_for(3, 5), "class_3");
    }

    #[test]
    fn device_strings_parse() {
        assert!(matches!(parse_device("cpu"), Ok(Device::Cpu)));
        assert!(matches!(parse_device("tpu"), Err(Error::InvalidInput(_))));
        assert!(matches!(parse_device("cuda:x"), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn missing_weights_fail_to_load() {
        let loader = YoloLoader::offline(DetectConfig::default(), Device::Cpu);

        let err = loader.load("/nonexistent/detector.safetensors").unwrap_err();

        assert!(matches!(err, Error::ModelLoadFailed(_)));
    }

    #[test]
    fn stock_names_need_a_downloader() {
        let loader = YoloLoader::offline(DetectConfig::default(), Device::Cpu);

        let err = loader.load("yolov8n.pt").unwrap_err();

        assert!(err.to_string().contains("downloads are disabled"));
    }

    #[test]
    fn predict_runs_the_full_pipeline_and_caps_detections() {
        let dir = scratch_dir("pipeline");
        let img = write_png(&dir, 320, 200);
        let model = zero_model(5);

        let predictions = model.predict(img.to_str().unwrap()).unwrap();
        std::fs::remove_dir_all(&dir).ok();

        assert_eq!((predictions.width, predictions.height), (320, 200));
        assert!(predictions.detections.len() <= 5);
        for d in &predictions.detections {
            assert!(d.bbox.xmin >= 0. && d.bbox.xmax <= 320.);
            assert!(d.bbox.ymin >= 0. && d.bbox.ymax <= 200.);
            assert!(d.class_id < 80);
        }
    }

    #[test]
    fn unreadable_image_is_an_image_error() {
        let model = zero_model(5);

        let err = model.predict("/nonexistent/scan.png").unwrap_err();

        assert!(matches!(err, Error::ImageError(_)));
    }

    #[test]
    fn custom_checkpoint_layout_comes_from_the_weights() {
        let dir = scratch_dir("custom");
        let path = save_network(&dir, "best.safetensors", "s", 3);

        let layout = inspect_weights(&path).unwrap();
        let loader = YoloLoader::offline(DetectConfig::default(), Device::Cpu);
        let model = loader.load(path.to_str().unwrap());
        std::fs::remove_dir_all(&dir).ok();

        assert_eq!(
            layout,
            WeightLayout {
                variant: Some("s"),
                num_classes: Some(3),
            }
        );
        let model = model.unwrap();
        assert_eq!(model.variant(), "s");
        assert_eq!(model.num_classes(), 3);
    }

    #[test]
    fn models_with_different_class_counts_share_a_registry() {
        let dir = scratch_dir("mixed");
        let scans = save_network(&dir, "yolov8n-scans.safetensors", "n", 3);
        let coco = save_network(&dir, "coco.safetensors", "n", 80);
        let img = write_png(&dir, 160, 96);

        let mut registry = ModelRegistry::new(YoloLoader::offline(DetectConfig::default(), Device::Cpu));
        registry.create_model("scans", scans.to_str().unwrap()).unwrap();
        registry.create_model("coco", coco.to_str().unwrap()).unwrap();

        let scan_predictions = registry.predict("scans", img.to_str().unwrap()).unwrap();
        let coco_predictions = registry.predict("coco", img.to_str().unwrap()).unwrap();
        std::fs::remove_dir_all(&dir).ok();

        assert_eq!(registry.get_model("scans").unwrap().handle().num_classes(), 3);
        assert_eq!(registry.get_model("coco").unwrap().handle().num_classes(), 80);
        for d in &scan_predictions.detections {
            assert!(d.class_id < 3);
            assert_eq!(d.label, format!("class_{}", d.class_id));
        }
        assert_eq!((coco_predictions.width, coco_predictions.height), (160, 96));
    }

    #[test]
    fn non_safetensors_files_are_rejected() {
        let path = std::env::temp_dir().join(format!("spotter-{}-weights.pt", std::process::id()));
        std::fs::write(&path, b"not a checkpoint").unwrap();
        let loader = YoloLoader::offline(DetectConfig::default(), Device::Cpu);

        let err = loader.load(path.to_str().unwrap()).unwrap_err();
        std::fs::remove_file(&path).ok();

        assert!(err.to_string().contains("not a safetensors"));
    }
}
