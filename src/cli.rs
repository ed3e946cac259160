use crate::{
    LogLevel,
    pipeline::UploadConfig,
    server::ServerConfig,
    startup_coordinator::ModelConfig,
    stream::StreamConfig,
    yolo::{ModelTask, OnnxConfig},
};
use anyhow::Context;
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Parser, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[command(author, version = env!("CARGO_PKG_VERSION"), about = "Licence plate reading service")]
#[serde(default)]
pub struct Cli {
    /// The port on which the server will listen for HTTP requests.
    /// Example usage: --port 1337
    #[arg(long, default_value_t = 8001)]
    pub port: u16,
    /// Path to the ONNX plate detection model
    #[arg(long, default_value = "models/best_detect.onnx")]
    pub plate_model: PathBuf,
    /// Path to the ONNX glyph recognition model
    #[arg(long, default_value = "models/best_ocr.onnx")]
    pub ocr_model: PathBuf,
    /// Output layout of the plate detection model
    #[arg(long, value_enum, default_value_t = ModelTask::Obb)]
    pub plate_model_task: ModelTask,
    /// Output layout of the glyph recognition model
    #[arg(long, value_enum, default_value_t = ModelTask::Detect)]
    pub ocr_model_task: ModelTask,
    /// Square input size both models were exported with
    #[arg(long, default_value_t = 640)]
    pub model_input_size: u32,
    /// Font for synthetic plates and stream legends, the built-in font is used
    /// when unset or unreadable
    #[arg(long)]
    pub font: Option<PathBuf>,
    /// Emblem drawn between the digit groups, omitted if missing
    #[arg(long, default_value = "assets/Tunisia_02.png")]
    pub logo: PathBuf,
    /// Directory for temporary uploads
    #[arg(long, default_value = "temp_uploads")]
    pub upload_dir: PathBuf,
    /// Read plates on every n-th frame of a live stream
    #[arg(long, default_value_t = 3)]
    pub frame_stride: u64,
    /// Minimum plate detection confidence in live streams
    #[arg(long, default_value_t = 0.45)]
    pub stream_confidence: f32,
    /// Minimum glyph confidence in live streams
    #[arg(long, default_value_t = 0.55)]
    pub stream_ocr_confidence: f32,
    /// Minimum glyph confidence for uploads
    #[arg(long, default_value_t = 0.50)]
    pub upload_ocr_confidence: f32,
    /// Minimum plate detection confidence for uploads
    #[arg(long, default_value_t = 0.25)]
    pub upload_detect_confidence: f32,
    /// Replaces numeric camera ids such as `?url=0`, which otherwise open
    /// `/dev/video<N>`. Any stream URL, video file or JPEG frame directory.
    #[arg(long)]
    pub local_camera: Option<String>,
    /// Force using CPU for inference
    #[arg(long, default_value_t = false)]
    pub force_cpu: bool,
    /// GPU Index, best effort to select the correct one if multiple GPUs exist.
    #[arg(long, default_value_t = 0)]
    pub gpu_index: i32,
    /// Intra thread parallelism max is cpu cores - 1
    #[arg(long, default_value_t = 192)]
    pub intra_threads: usize,
    /// Inter thread parallelism max is cpu cores - 1
    #[arg(long, default_value_t = 192)]
    pub inter_threads: usize,
    /// Sets the level of logging
    #[arg(long, value_enum, default_value_t = LogLevel::Info)]
    pub log_level: LogLevel,
    /// If log_path is set, then stdout logging will be disabled and it will log to file
    #[arg(long)]
    pub log_path: Option<PathBuf>,
    /// JSON configuration file, replaces all other options when given
    #[arg(long)]
    #[serde(skip)]
    pub config: Option<PathBuf>,
}

impl Default for Cli {
    fn default() -> Self {
        Cli::parse_from([env!("CARGO_PKG_NAME")])
    }
}

impl Cli {
    /// Parses the command line, then swaps in the JSON configuration file if
    /// `--config` names one.
    pub fn from_config_and_args() -> anyhow::Result<Self> {
        let args = Cli::parse();
        match args.config {
            Some(path) => Self::load_config(&path),
            None => Ok(args),
        }
    }

    pub fn load_config(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {path:?}"))?;
        let mut cli: Cli = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse config file {path:?}"))?;
        cli.config = Some(path.to_path_buf());
        Ok(cli)
    }

    pub fn print_config(&self) {
        info!("Configuration:");
        info!("  port: {}", self.port);
        info!("  plate model: {:?} ({})", self.plate_model, self.plate_model_task);
        info!("  ocr model: {:?} ({})", self.ocr_model, self.ocr_model_task);
        info!("  model input size: {}", self.model_input_size);
        info!("  font: {:?}, logo: {:?}", self.font, self.logo);
        info!("  upload dir: {:?}", self.upload_dir);
        info!(
            "  stream: every {} frames, detect {} / ocr {}",
            self.frame_stride, self.stream_confidence, self.stream_ocr_confidence
        );
        info!(
            "  upload: detect {} / ocr {}",
            self.upload_detect_confidence, self.upload_ocr_confidence
        );
        info!("  local camera: {:?}", self.local_camera);
        info!(
            "  force cpu: {}, gpu index: {}, threads: {} intra / {} inter",
            self.force_cpu, self.gpu_index, self.intra_threads, self.inter_threads
        );
        info!("  log level: {:?}, log path: {:?}", self.log_level, self.log_path);
    }

    fn onnx_config(&self, model: &Path, task: ModelTask) -> OnnxConfig {
        OnnxConfig {
            intra_threads: self.intra_threads,
            inter_threads: self.inter_threads,
            gpu_index: self.gpu_index,
            force_cpu: self.force_cpu,
            model: model.to_path_buf(),
            task,
            input_size: self.model_input_size,
        }
    }

    pub fn model_config(&self) -> ModelConfig {
        ModelConfig {
            plate_model: self.onnx_config(&self.plate_model, self.plate_model_task),
            ocr_model: self.onnx_config(&self.ocr_model, self.ocr_model_task),
            font: self.font.clone(),
            logo: Some(self.logo.clone()),
        }
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            port: self.port,
            upload_dir: self.upload_dir.clone(),
            upload: UploadConfig {
                detect_confidence: self.upload_detect_confidence,
                ocr_confidence: self.upload_ocr_confidence,
            },
            stream: StreamConfig {
                frame_stride: self.frame_stride,
                detect_confidence: self.stream_confidence,
                ocr_confidence: self.stream_ocr_confidence,
            },
            local_camera: self.local_camera.clone(),
        }
    }
}
