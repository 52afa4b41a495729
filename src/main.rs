use anyhow::Context;
use clap::Parser;
use spotter::cli::{normalize_variant, Cli, Commands};
use spotter::config::Config;
use spotter::detector::{parse_device, YoloLoader};
use spotter::model::{ModelRegistry, WeightDownloader};
use spotter::server;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::from_env().context("failed to load configuration")?;

    match cli.command {
        Commands::Pull { variant } => {
            let downloader = WeightDownloader::new(&config)?;
            let path = downloader.fetch(normalize_variant(&variant))?;

            println!("✓ Successfully pulled yolov8{}", normalize_variant(&variant));
            println!("  Repository: {}", config.detect.hub_repo);
            println!("  Path: {:?}", path);
        }

        Commands::Predict {
            model,
            image,
            name,
            device,
        } => {
            if image.is_empty() {
                anyhow::bail!("No image provided. Use --image path/to/image.jpg");
            }

            let device = parse_device(&device)?;
            let loader = YoloLoader::new(&config, device)?;
            let mut registry = ModelRegistry::new(loader);

            let name = registry
                .create_model(name, &model)
                .with_context(|| format!("failed to load model {}", model))?;

            let mut results = Vec::with_capacity(image.len());
            for img in &image {
                results.push(registry.predict(&name, img)?);
            }

            let output = serde_json::json!({
                "model": name,
                "results": results,
            });

            println!("{}", serde_json::to_string_pretty(&output)?);
        }

        Commands::Serve {
            device,
            port,
            host,
            models,
        } => {
            let device = parse_device(&device)?;
            let device_name = format!("{:?}", device);

            let loader = YoloLoader::new(&config, device)?;
            let mut registry = ModelRegistry::new(loader);
            for (name, path) in &models {
                registry
                    .create_model(name.as_str(), path)
                    .with_context(|| format!("failed to preload model '{}' from {}", name, path))?;
            }

            let state = server::AppState::new(registry, device_name.clone());

            println!("🚀 Spotter server starting...");
            println!("   Device: {}", device_name);
            println!("   Preloaded models: {}", models.len());
            println!("   Listening on: http://{}:{}", host, port);
            println!("   Health: http://{}:{}/api/health", host, port);
            println!("   Models: http://{}:{}/api/models", host, port);
            println!("   Predict: http://{}:{}/api/predict", host, port);

            server::serve(&host, port, state).await?;
        }
    }

    Ok(())
}
