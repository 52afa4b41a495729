use crate::error::{Error, Result};
use crate::model::{DetectionModel, ModelInfo, ModelLoader, ModelRegistry};
use axum::{
	extract::State,
	http::StatusCode,
	response::{IntoResponse, Response},
	routing::{get, post},
	Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

/// Shared server state. Registration takes the write lock; prediction and
/// listing share the read lock. Loading and inference run on the blocking
/// pool so a slow download or forward pass does not stall the runtime.
pub struct AppState<L: ModelLoader> {
	registry: Arc<RwLock<ModelRegistry<L>>>,
	device_name: String,
}

impl<L: ModelLoader> Clone for AppState<L> {
	fn clone(&self) -> Self {
		Self {
			registry: Arc::clone(&self.registry),
			device_name: self.device_name.clone(),
		}
	}
}

impl<L: ModelLoader> AppState<L> {
	pub fn new(registry: ModelRegistry<L>, device_name: String) -> Self {
		Self {
			registry: Arc::new(RwLock::new(registry)),
			device_name,
		}
	}
}

#[derive(Serialize)]
pub struct HealthResponse {
	pub status: String,
	pub device: String,
	pub models: usize,
}

#[derive(Deserialize)]
pub struct CreateModelRequest {
	pub name: String,
	pub model_path: String,
}

#[derive(Serialize)]
pub struct CreateModelResponse {
	pub name: String,
}

#[derive(Deserialize)]
pub struct PredictRequest {
	pub name: String,
	pub image_path: String,
}

impl IntoResponse for Error {
	fn into_response(self) -> Response {
		let status = match self {
			Error::ModelNotFound(_) => StatusCode::NOT_FOUND,
			Error::InvalidInput(_) => StatusCode::BAD_REQUEST,
			Error::ModelLoadFailed(_) | Error::ImageError(_) => StatusCode::UNPROCESSABLE_ENTITY,
			Error::DownloadFailed(_) => StatusCode::BAD_GATEWAY,
			_ => StatusCode::INTERNAL_SERVER_ERROR,
		};

		tracing::error!("Request failed: {} ({})", self, status);

		let body = Json(serde_json::json!({
			"error": self.to_string(),
		}));

		(status, body).into_response()
	}
}

async fn health_handler<L>(State(state): State<AppState<L>>) -> Json<HealthResponse>
where
	L: ModelLoader + Send + Sync + 'static,
	L::Model: Send + Sync,
{
	let registry = state.registry.read().await;

	Json(HealthResponse {
		status: "ok".to_string(),
		device: state.device_name.clone(),
		models: registry.len(),
	})
}

async fn list_handler<L>(State(state): State<AppState<L>>) -> Json<Vec<ModelInfo>>
where
	L: ModelLoader + Send + Sync + 'static,
	L::Model: Send + Sync,
{
	let registry = state.registry.read().await;
	Json(registry.list_models().into_iter().cloned().collect())
}

async fn create_model_handler<L>(
	State(state): State<AppState<L>>,
	Json(payload): Json<CreateModelRequest>,
) -> Result<(StatusCode, Json<CreateModelResponse>)>
where
	L: ModelLoader + Send + Sync + 'static,
	L::Model: Send + Sync,
{
	if payload.name.is_empty() {
		return Err(Error::InvalidInput("Model name cannot be empty".to_string()));
	}

	let registry = Arc::clone(&state.registry);
	let name = tokio::task::spawn_blocking(move || {
		registry
			.blocking_write()
			.create_model(payload.name, &payload.model_path)
	})
	.await
	.map_err(|e| Error::ModelLoadFailed(format!("Load task failed: {}", e)))??;

	Ok((StatusCode::CREATED, Json(CreateModelResponse { name })))
}

async fn predict_handler<L>(
	State(state): State<AppState<L>>,
	Json(payload): Json<PredictRequest>,
) -> Result<Json<<L::Model as DetectionModel>::Output>>
where
	L: ModelLoader + Send + Sync + 'static,
	L::Model: Send + Sync,
	<L::Model as DetectionModel>::Output: Serialize + Send,
{
	let registry = Arc::clone(&state.registry);
	let output = tokio::task::spawn_blocking(move || {
		registry
			.blocking_read()
			.predict(&payload.name, &payload.image_path)
	})
	.await
	.map_err(|e| Error::PredictionFailed(format!("Inference task failed: {}", e)))??;

	Ok(Json(output))
}

pub fn create_router<L>(state: AppState<L>) -> Router
where
	L: ModelLoader + Send + Sync + 'static,
	L::Model: Send + Sync,
	<L::Model as DetectionModel>::Output: Serialize + Send,
{
	Router::new()
		.route("/api/health", get(health_handler::<L>))
		.route("/api/models", get(list_handler::<L>).post(create_model_handler::<L>))
		.route("/api/predict", post(predict_handler::<L>))
		.layer(TraceLayer::new_for_http())
		.layer(CorsLayer::permissive())
		.with_state(state)
}

pub async fn serve<L>(host: &str, port: u16, state: AppState<L>) -> Result<()>
where
	L: ModelLoader + Send + Sync + 'static,
	L::Model: Send + Sync,
	<L::Model as DetectionModel>::Output: Serialize + Send,
{
	let app = create_router(state);
	let addr = format!("{}:{}", host, port);

	tracing::info!("Starting server on {}", addr);

	let listener = tokio::net::TcpListener::bind(&addr)
		.await
		.map_err(|e| Error::ConfigError(format!("Failed to bind to {}: {}", addr, e)))?;

	axum::serve(listener, app)
		.await
		.map_err(|e| Error::ConfigError(format!("Server error: {}", e)))?;

	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use axum::body::Body;
	use axum::http::{header, Request};
	use serde_json::Value;
	use std::sync::atomic::{AtomicUsize, Ordering};
	use tower::ServiceExt;

	#[derive(Default)]
	struct StubLoader {
		inferences: Arc<AtomicUsize>,
	}

	struct StubModel {
		path: String,
		inferences: Arc<AtomicUsize>,
	}

	impl ModelLoader for StubLoader {
		type Model = StubModel;

		fn load(&self, model_path: &str) -> Result<StubModel> {
			if model_path == "slow.pt" {
				std::thread::sleep(std::time::Duration::from_millis(400));
			}
			if !model_path.ends_with(".pt") {
				return Err(Error::ModelLoadFailed(format!("cannot read {}", model_path)));
			}
			Ok(StubModel {
				path: model_path.to_string(),
				inferences: Arc::clone(&self.inferences),
			})
		}
	}

	impl DetectionModel for StubModel {
		type Output = Value;

		fn predict(&self, img_path: &str) -> Result<Value> {
			self.inferences.fetch_add(1, Ordering::SeqCst);
			Ok(serde_json::json!({ "model": self.path, "image": img_path }))
		}
	}

	fn app() -> (Router, Arc<AtomicUsize>) {
		let loader = StubLoader::default();
		let inferences = Arc::clone(&loader.inferences);
		let state = AppState::new(ModelRegistry::new(loader), "Cpu".to_string());
		(create_router(state), inferences)
	}

	fn post_json(uri: &str, body: Value) -> Request<Body> {
		Request::post(uri)
			.header(header::CONTENT_TYPE, "application/json")
			.body(Body::from(body.to_string()))
			.unwrap()
	}

	async fn json_body(response: Response) -> Value {
		let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
		serde_json::from_slice(&bytes).unwrap()
	}

	#[tokio::test]
	async fn create_then_predict() {
		let (app, inferences) = app();

		let response = app
			.clone()
			.oneshot(post_json(
				"/api/models",
				serde_json::json!({ "name": "detector", "model_path": "model.pt" }),
			))
			.await
			.unwrap();
		assert_eq!(response.status(), StatusCode::CREATED);
		assert_eq!(json_body(response).await["name"], "detector");

		let response = app
			.oneshot(post_json(
				"/api/predict",
				serde_json::json!({ "name": "detector", "image_path": "img.jpg" }),
			))
			.await
			.unwrap();
		assert_eq!(response.status(), StatusCode::OK);
		let body = json_body(response).await;
		assert_eq!(body["model"], "model.pt");
		assert_eq!(body["image"], "img.jpg");
		assert_eq!(inferences.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn slow_load_leaves_the_runtime_responsive() {
		let (app, _) = app();

		let pending = tokio::spawn(app.clone().oneshot(post_json(
			"/api/models",
			serde_json::json!({ "name": "detector", "model_path": "slow.pt" }),
		)));
		tokio::time::sleep(std::time::Duration::from_millis(50)).await;

		assert!(!pending.is_finished());
		let response = pending.await.unwrap().unwrap();
		assert_eq!(response.status(), StatusCode::CREATED);
	}

	#[tokio::test]
	async fn predict_with_unknown_name_is_404() {
		let (app, inferences) = app();

		let response = app
			.oneshot(post_json(
				"/api/predict",
				serde_json::json!({ "name": "missing", "image_path": "img.jpg" }),
			))
			.await
			.unwrap();

		assert_eq!(response.status(), StatusCode::NOT_FOUND);
		assert_eq!(json_body(response).await["error"], "Model not found: missing");
		assert_eq!(inferences.load(Ordering::SeqCst), 0);
	}

	#[tokio::test]
	async fn load_failure_is_unprocessable() {
		let (app, _) = app();

		let response = app
			.oneshot(post_json(
				"/api/models",
				serde_json::json!({ "name": "detector", "model_path": "model.onnx" }),
			))
			.await
			.unwrap();

		assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
	}

	#[tokio::test]
	async fn empty_name_is_rejected() {
		let (app, _) = app();

		let response = app
			.oneshot(post_json(
				"/api/models",
				serde_json::json!({ "name": "", "model_path": "model.pt" }),
			))
			.await
			.unwrap();

		assert_eq!(response.status(), StatusCode::BAD_REQUEST);
	}

	#[tokio::test]
	async fn list_and_health_report_registered_models() {
		let (app, _) = app();
		for (name, path) in [("b", "b.pt"), ("a", "a.pt")] {
			app.clone()
				.oneshot(post_json(
					"/api/models",
					serde_json::json!({ "name": name, "model_path": path }),
				))
				.await
				.unwrap();
		}

		let response = app
			.clone()
			.oneshot(Request::get("/api/models").body(Body::empty()).unwrap())
			.await
			.unwrap();
		let body = json_body(response).await;
		let names: Vec<&str> = body
			.as_array()
			.unwrap()
			.iter()
			.map(|m| m["name"].as_str().unwrap())
			.collect();
		assert_eq!(names, vec!["a", "b"]);

		let response = app
			.oneshot(Request::get("/api/health").body(Body::empty()).unwrap())
			.await
			.unwrap();
		let body = json_body(response).await;
		assert_eq!(body["status"], "ok");
		assert_eq!(body["models"], 2);
	}
}
