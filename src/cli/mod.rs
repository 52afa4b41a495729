use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "spotter")]
#[command(version, about = "A named registry of YOLO object-detection models", long_about = None)]
pub struct Cli {
	#[command(subcommand)]
	pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
	/// Download stock YOLOv8 weights from HuggingFace
	Pull {
		/// Variant to download: n, s, m, l or x (e.g., "yolov8n" or "n")
		variant: String,
	},

	/// Register a model and run it on one or more images
	Predict {
		/// Weight file or stock model name (e.g., "yolov8n.pt")
		model: String,

		/// Image to run on (can be specified multiple times)
		#[arg(long)]
		image: Vec<String>,

		/// Name to register the model under
		#[arg(long, default_value = "default")]
		name: String,

		/// Device to run on (e.g., "cpu" or "cuda:0")
		#[arg(long, default_value = "cpu")]
		device: String,
	},

	/// Start the HTTP API server
	Serve {
		/// Device to run on (e.g., "cpu" or "cuda:0")
		#[arg(long, default_value = "cpu")]
		device: String,

		/// Port to listen on
		#[arg(long, default_value = "8080")]
		port: u16,

		/// Host to bind to
		#[arg(long, default_value = "0.0.0.0")]
		host: String,

		/// Model to register at startup as NAME=PATH (can be specified multiple times)
		#[arg(long = "model", value_parser = parse_model_spec)]
		models: Vec<(String, String)>,
	},
}

pub fn parse_model_spec(spec: &str) -> Result<(String, String), String> {
	match spec.split_once('=') {
		Some((name, path)) if !name.is_empty() && !path.is_empty() => {
			Ok((name.to_string(), path.to_string()))
		}
		_ => Err(format!("expected NAME=PATH, got '{}'", spec)),
	}
}

/// Accepts "n" as well as "yolov8n".
pub fn normalize_variant(variant: &str) -> &str {
	variant.strip_prefix("yolov8").unwrap_or(variant)
}
