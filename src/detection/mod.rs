// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 检测阶段 (Detection stages)
//!
//! 每帧独立, 在线程池中并行执行
//! - Preprocessor:  letterbox + 归一化
//! - Postprocessor: 解码 + 按类别 NMS
//! - Annotator:     绘制与编码

pub mod annotate;
pub mod postprocess;
pub mod preprocess;
pub mod types;

pub use annotate::{encode_image, load_font, Annotator};
pub use postprocess::{Postprocessor, TaskHead};
pub use preprocess::{stack_batch, Letterbox, PreparedFrame, Preprocessor};
pub use types::{Bbox, Detection, Mask, Point2};
