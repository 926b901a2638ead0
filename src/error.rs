// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 错误分类 (Error taxonomy)
//!
//! - Fatal: 配置无效 / 模型加载失败, 进程无法启动
//! - Batch-wide: 推理失败或超时, 本轮结果作废
//! - Per-source: 摄像头打开/读取失败, 仅影响对应窗口
//! - Per-frame: 帧损坏 / 解码异常, 仅影响该帧

use std::time::Duration;

use thiserror::Error;

use crate::{DestinationId, SourceId};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        ConfigError::Load(Box::new(err))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CaptureError {
    #[error("Error: Camera {id} is invalid. ({reason})")]
    Open { id: SourceId, reason: String },

    #[error("Error: Could not read frame from camera {id}. ({reason})")]
    Read { id: SourceId, reason: String },

    #[error("Error: Camera {id} is not open.")]
    NotOpen { id: SourceId },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoutingError {
    #[error("unknown destination {destination} (only {destinations} configured)")]
    UnknownDestination {
        destination: DestinationId,
        destinations: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("malformed frame from camera {id}: {reason}")]
    Malformed { id: SourceId, reason: String },

    #[error("failed to decode model output: {0}")]
    Decode(String),

    #[error("failed to draw annotations: {0}")]
    Annotate(String),

    #[error("failed to encode image: {0}")]
    Encode(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InferenceError {
    #[error("inference timed out after {0:?}")]
    Timeout(Duration),

    #[error("inference engine is still busy with a previous batch")]
    Busy,

    #[error("inference failed: {0}")]
    Run(String),

    #[error("inference engine stopped")]
    Disconnected,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to load model: {0:#}")]
    ModelLoad(anyhow::Error),

    #[error("failed to build worker pool: {0}")]
    WorkerPool(#[from] rayon::ThreadPoolBuildError),

    #[error("failed to spawn inference thread: {0}")]
    Spawn(#[from] std::io::Error),
}
