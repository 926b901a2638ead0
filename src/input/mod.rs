// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 摄像头输入系统 (Camera Input System)
//!
//! 每路摄像头独立读取线程, 只保留最新帧
//! - SourceManager: 打开/关闭/读取/健康状态/枚举
//! - FfmpegFactory: 本地摄像头 (DirectShow/AVFoundation/V4L2)
//! - StillImageFactory: 静态图片源

pub mod camera;
pub mod source_manager;
pub mod still;
pub mod types;

pub use camera::{
    list_device_names, CameraDevice, DeviceFactory, FfmpegCamera, FfmpegFactory, Interrupt,
};
pub use source_manager::{SourceConfig, SourceManager};
pub use still::StillImageFactory;
pub use types::{Frame, RawFrame, ReadOutcome, SourceStatus};
