// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 模型统一接口与实现
//!
//! ## Model Trait
//! 推理线程只依赖这个接口: 一次调用 = 一次批量前向推理。
//! 预处理/后处理与模型解耦, 在线程池中按帧并行执行。
//!
//! ## ModelInfo
//! 加载后确定的任务头、类别数、输入尺寸与类别名,
//! 后处理器与标注器据此构建。

use anyhow::Result;
use ndarray::{Array, IxDyn};

use crate::detection::TaskHead;
use crate::{Args, ConfigError, YOLOTask};

pub mod yolov8;

pub use yolov8::YOLOv8;

pub trait Model: Send {
    /// 批量前向推理, 输出顺序与模型声明一致
    fn run(&mut self, xs: Array<f32, IxDyn>) -> Result<Vec<Array<f32, IxDyn>>>;

    /// 打印模型信息
    fn summary(&self) {}
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModelInfo {
    pub head: TaskHead,
    pub nc: usize,
    pub width: u32,
    pub height: u32,
    pub names: Vec<String>,
    /// 固定批大小; None 表示动态
    pub fixed_batch: Option<usize>,
}

impl ModelInfo {
    /// 仅由配置得到模型信息 (没有模型元数据可用时)
    pub fn from_args(args: &Args) -> Result<Self, ConfigError> {
        let nc = args
            .nc
            .ok_or_else(|| ConfigError::Invalid("nc is required".into()))?;
        let head = task_head(args.task, args.nk, args.nm)?;
        Ok(Self {
            head,
            nc: nc as usize,
            width: args.width,
            height: args.height,
            names: Vec::new(),
            fixed_batch: None,
        })
    }
}

/// 任务 + 关键点数/掩码数 → 任务头
pub fn task_head(task: YOLOTask, nk: Option<u32>, nm: Option<u32>) -> Result<TaskHead, ConfigError> {
    match task {
        YOLOTask::Detect => Ok(TaskHead::Detect),
        YOLOTask::Pose => match nk {
            Some(nk) if nk > 0 => Ok(TaskHead::Pose { nk: nk as usize }),
            _ => Err(ConfigError::Invalid(
                "failed to get num_keypoints, make it explicit with `nk`".into(),
            )),
        },
        YOLOTask::Segment => match nm {
            Some(nm) if nm > 0 => Ok(TaskHead::Segment { nm: nm as usize }),
            _ => Err(ConfigError::Invalid(
                "failed to get num_masks, make it explicit with `nm`".into(),
            )),
        },
    }
}
