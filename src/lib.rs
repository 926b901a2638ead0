#![allow(clippy::type_complexity)]
// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
pub mod config; // 启动配置参数
pub mod control; // 外壳命令与事件
pub mod detection; // 预处理/后处理/标注
pub mod error; // 错误分类
pub mod input; // 摄像头输入系统
pub mod models; // 模型接口与具体实现
pub mod ort_backend;
pub mod pipeline; // 多路推理流水线
pub mod telemetry; // 日志初始化

pub use crate::config::Args;
pub use crate::detection::{Bbox, Detection, Mask, Point2};
pub use crate::error::{
    CaptureError, ConfigError, FrameError, InferenceError, PipelineError, RoutingError,
};
pub use crate::models::{Model, ModelInfo, YOLOv8};
pub use crate::ort_backend::{Batch, OrtBackend, OrtConfig, OrtEP, YOLOTask};
pub use crate::pipeline::Orchestrator;

/// 摄像头编号
pub type SourceId = u32;

/// 显示窗口编号
pub type DestinationId = usize;

/// Class-aware non-max suppression.
///
/// Candidates are ordered by confidence (stable, so equal scores keep their
/// decode order) and a candidate is dropped when it overlaps an already kept
/// candidate of the same class by more than `iou_threshold`.
pub fn non_max_suppression<T>(xs: &mut Vec<(Bbox, T)>, iou_threshold: f32) {
    xs.sort_by(|b1, b2| b2.0.confidence().total_cmp(&b1.0.confidence()));

    let mut current_index = 0;
    for index in 0..xs.len() {
        let mut drop = false;
        for prev_index in 0..current_index {
            if xs[prev_index].0.id() != xs[index].0.id() {
                continue;
            }
            let iou = xs[prev_index].0.iou(&xs[index].0);
            if iou > iou_threshold {
                drop = true;
                break;
            }
        }
        if !drop {
            xs.swap(current_index, index);
            current_index += 1;
        }
    }
    xs.truncate(current_index);
}

pub const SKELETON: [(usize, usize); 16] = [
    (0, 1),
    (0, 2),
    (1, 3),
    (2, 4),
    (5, 6),
    (5, 11),
    (6, 12),
    (11, 12),
    (5, 7),
    (6, 8),
    (7, 9),
    (8, 10),
    (11, 13),
    (12, 14),
    (13, 15),
    (14, 16),
];
