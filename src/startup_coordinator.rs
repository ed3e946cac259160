use crate::{
    models::Models,
    pipeline::PlateError,
    render::PlateRenderer,
    yolo::{OnnxConfig, YoloModel},
};
use std::{
    path::PathBuf,
    sync::{Arc, PoisonError, RwLock},
    time::Instant,
};
use tokio::sync::oneshot;
use tracing::{error, info};

pub const NOT_READY_MESSAGE: &str = "Server not ready yet, models are still loading";

#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub plate_model: OnnxConfig,
    pub ocr_model: OnnxConfig,
    pub font: Option<PathBuf>,
    pub logo: Option<PathBuf>,
}

/// Information about the loaded models
#[derive(Debug, Clone)]
pub struct ModelInfo {
    pub plate_model: String,
    pub ocr_model: String,
    pub execution_provider: String,
}

/// Result of model initialization
pub enum InitResult {
    Success { models: Arc<Models>, info: ModelInfo },
    Failed(String),
}

/// Loads both models and the plate assets on a background thread and returns
/// a receiver that gets them once loading is complete.
pub fn spawn_model_initialization(config: ModelConfig) -> oneshot::Receiver<InitResult> {
    let (init_sender, init_receiver) = oneshot::channel();

    std::thread::spawn(move || {
        startup_worker_thread(init_sender, config);
    });

    init_receiver
}

fn load_models(config: &ModelConfig) -> anyhow::Result<(Models, ModelInfo)> {
    let plate_model = YoloModel::new(&config.plate_model)?;
    let ocr_model = YoloModel::new(&config.ocr_model)?;
    let info = ModelInfo {
        plate_model: plate_model.model_name().to_string(),
        ocr_model: ocr_model.model_name().to_string(),
        execution_provider: plate_model.endpoint_provider_name(),
    };
    let renderer = PlateRenderer::load(config.font.as_deref(), config.logo.as_deref());
    Ok((
        Models::new(Box::new(plate_model), Box::new(ocr_model), renderer),
        info,
    ))
}

fn startup_worker_thread(init_sender: oneshot::Sender<InitResult>, config: ModelConfig) {
    info!("Startup worker thread: Beginning model initialization...");
    let start = Instant::now();

    let result = match load_models(&config) {
        Ok((models, model_info)) => {
            info!(
                plate_model = %model_info.plate_model,
                ocr_model = %model_info.ocr_model,
                execution_provider = %model_info.execution_provider,
                elapsed = ?start.elapsed(),
                "Startup worker thread: Model initialization complete"
            );
            InitResult::Success {
                models: Arc::new(models),
                info: model_info,
            }
        }
        Err(e) => {
            error!(error = %format!("{e:#}"), "Startup worker thread: Model initialization failed");
            InitResult::Failed(format!("{e:#}"))
        }
    };

    if init_sender.send(result).is_err() {
        error!("Startup worker thread: Failed to send initialization result to server");
    }
}

#[derive(Clone)]
pub enum ModelsReady {
    NotReady,
    Ready(Arc<Models>),
    Failed(String),
}

/// Where request handlers and stream producers pick up the models once they
/// are loaded.
pub struct ModelSlot {
    state: RwLock<ModelsReady>,
}

impl Default for ModelSlot {
    fn default() -> Self {
        Self {
            state: RwLock::new(ModelsReady::NotReady),
        }
    }
}

impl ModelSlot {
    pub fn ready(models: Arc<Models>) -> Self {
        Self {
            state: RwLock::new(ModelsReady::Ready(models)),
        }
    }

    fn set(&self, state: ModelsReady) {
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = state;
    }

    pub fn state(&self) -> ModelsReady {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// The models if loaded, otherwise the error clients should see.
    pub fn get(&self) -> Result<Arc<Models>, PlateError> {
        match self.state() {
            ModelsReady::Ready(models) => Ok(models),
            ModelsReady::NotReady => Err(PlateError::NotReady(NOT_READY_MESSAGE.to_string())),
            ModelsReady::Failed(error) => Err(PlateError::NotReady(format!(
                "Model initialization failed: {error}"
            ))),
        }
    }

    pub fn models(&self) -> Option<Arc<Models>> {
        self.get().ok()
    }

    /// Waits for the startup thread and publishes its outcome.
    pub async fn wait_for(self: Arc<Self>, init_receiver: oneshot::Receiver<InitResult>) {
        match init_receiver.await {
            Ok(InitResult::Success { models, info }) => {
                info!(
                    plate_model = %info.plate_model,
                    ocr_model = %info.ocr_model,
                    "Models ready - server can now handle requests"
                );
                self.set(ModelsReady::Ready(models));
            }
            Ok(InitResult::Failed(error)) => {
                error!(error = %error, "Model initialization failed");
                self.set(ModelsReady::Failed(error));
            }
            Err(_) => {
                error!("Model initialization channel was dropped");
                self.set(ModelsReady::Failed(
                    "Initialization channel dropped".to_string(),
                ));
            }
        }
    }
}
