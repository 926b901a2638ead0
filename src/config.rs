// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 启动配置 (Startup configuration)
//!
//! 加载顺序: 默认值 → TOML 文件 → `FOD_` 环境变量, 命令行覆盖由可执行文件负责。
//! 加载后不可变。

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use image::ImageFormat;
use serde::{Deserialize, Serialize};

use crate::{ConfigError, DestinationId, SourceId, YOLOTask};

/// 初始路由: 窗口 → 摄像头
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub destination: DestinationId,
    pub source: SourceId,
}

/// 静态图片输入源 (演示/测试用)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StillImage {
    pub source: SourceId,
    pub path: PathBuf,
}

/// 输出图像编码格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncodeFormat {
    #[default]
    Bmp,
    Png,
    Jpeg,
}

impl EncodeFormat {
    pub fn image_format(&self) -> ImageFormat {
        match self {
            EncodeFormat::Bmp => ImageFormat::Bmp,
            EncodeFormat::Png => ImageFormat::Png,
            EncodeFormat::Jpeg => ImageFormat::Jpeg,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EncodeFormat::Bmp => "bmp",
            EncodeFormat::Png => "png",
            EncodeFormat::Jpeg => "jpeg",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Args {
    /// ONNX model path
    pub model: String,

    /// specify YOLO task
    pub task: YOLOTask,

    /// num_classes
    pub nc: Option<u32>,

    /// num_keypoints
    pub nk: Option<u32>,

    /// num_masks
    pub nm: Option<u32>,

    /// input image width
    pub width: u32,

    /// input image height
    pub height: u32,

    /// confidence threshold
    pub conf: f32,

    /// iou threshold in NMS
    pub iou: f32,

    /// confidence threshold of keypoint
    pub kconf: f32,

    /// input batch size
    pub batch: u32,

    /// min frames per batch
    pub batch_min: u32,

    /// max frames per batch, the rest are deferred
    pub batch_max: u32,

    /// using CUDA EP
    pub cuda: bool,

    /// using TensorRT EP
    pub trt: bool,

    /// using TensorRT --fp16
    pub fp16: bool,

    /// device id
    pub device_id: u32,

    /// draw detections onto emitted frames
    pub annotate: bool,

    /// check time consumed in each stage
    pub profile: bool,

    /// number of display destinations
    pub destinations: usize,

    /// initial destination → camera mapping
    pub routes: Vec<Route>,

    /// acquisition window per iteration
    pub acquire_timeout_ms: u64,

    /// upper bound of one batched forward pass
    pub inference_timeout_ms: u64,

    /// consecutive read failures before a camera is marked errored
    pub max_read_failures: u32,

    /// delay before reopening an errored camera
    pub reopen_interval_ms: u64,

    /// camera indices probed by "poll sources"
    pub probe_limit: u32,

    /// period of the automatic camera enumeration, 0 disables it
    pub poll_interval_ms: u64,

    pub capture_width: u32,
    pub capture_height: u32,
    pub capture_fps: u32,

    /// encoding of emitted images
    pub image_format: EncodeFormat,

    /// TTF font for labels
    pub font: Option<PathBuf>,

    /// sources served from image files instead of cameras
    pub still_images: Vec<StillImage>,
}

impl Default for Args {
    fn default() -> Self {
        Args {
            model: "./models/yolov8n.onnx".to_string(), // ONNX model path
            task: YOLOTask::Detect,                     // Define the task
            nc: Some(5),                                // Number of classes
            nk: None,                                   // Number of keypoints
            nm: None,                                   // Number of masks
            width: 512,                                 // Input image width for YOLO model
            height: 512,                                // Input image height for YOLO model
            conf: 0.5,                                  // Confidence threshold for detections
            iou: 0.5,                                   // IoU threshold for Non-Max Suppression
            kconf: 0.5,                                 // Keypoint confidence threshold
            batch: 3,                                   // Set the batch size to 3
            batch_min: 1,
            batch_max: 3,
            cuda: true,
            trt: false,
            fp16: false,
            device_id: 0,
            annotate: true,
            profile: false,
            destinations: 3, // top / side / detail views
            routes: Vec::new(),
            acquire_timeout_ms: 50,
            inference_timeout_ms: 2000,
            max_read_failures: 3,
            reopen_interval_ms: 1000,
            probe_limit: 8,
            poll_interval_ms: 30_000,
            capture_width: 640,
            capture_height: 480,
            capture_fps: 30,
            image_format: EncodeFormat::Bmp,
            font: None,
            still_images: Vec::new(),
        }
    }
}

impl Args {
    /// 加载并校验配置; 文件不存在时使用默认值
    pub fn load(toml: &Path) -> Result<Self, ConfigError> {
        let args: Args = Figment::from(Serialized::defaults(Args::default()))
            .merge(Toml::file(toml))
            .merge(Env::prefixed("FOD_"))
            .extract()?;
        args.validate()?;
        Ok(args)
    }

    /// 从 TOML 字符串加载 (不读取环境变量)
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let args: Args = Figment::from(Serialized::defaults(Args::default()))
            .merge(Toml::string(s))
            .extract()?;
        args.validate()?;
        Ok(args)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.batch_min == 0 {
            return invalid("batch_min must be at least 1".into());
        }
        if !(self.batch_min <= self.batch && self.batch <= self.batch_max) {
            return invalid(format!(
                "expected batch_min <= batch <= batch_max, got {} / {} / {}",
                self.batch_min, self.batch, self.batch_max
            ));
        }
        for (name, v) in [("conf", self.conf), ("iou", self.iou), ("kconf", self.kconf)] {
            if !(0.0..=1.0).contains(&v) {
                return invalid(format!("{name} must be within [0, 1], got {v}"));
            }
        }
        if self.width == 0 || self.height == 0 {
            return invalid(format!(
                "model input size must be positive, got {}x{}",
                self.width, self.height
            ));
        }
        if self.destinations == 0 {
            return invalid("at least one destination is required".into());
        }
        if let Some(route) = self.routes.iter().find(|r| r.destination >= self.destinations) {
            return invalid(format!(
                "route to destination {} but only {} destinations are configured",
                route.destination, self.destinations
            ));
        }
        if self.nc == Some(0) {
            return invalid("nc must be positive".into());
        }
        if self.acquire_timeout_ms == 0 || self.inference_timeout_ms == 0 {
            return invalid("timeouts must be positive".into());
        }
        if self.max_read_failures == 0 {
            return invalid("max_read_failures must be at least 1".into());
        }
        Ok(())
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn inference_timeout(&self) -> Duration {
        Duration::from_millis(self.inference_timeout_ms)
    }

    pub fn reopen_interval(&self) -> Duration {
        Duration::from_millis(self.reopen_interval_ms)
    }

    pub fn poll_interval(&self) -> Option<Duration> {
        match self.poll_interval_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let args = Args::default();
        assert!(args.validate().is_ok());
        assert_eq!(args.destinations, 3);
        assert_eq!((args.batch, args.batch_min, args.batch_max), (3, 1, 3));
        assert_eq!(args.poll_interval(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_zero_poll_interval_disables_polling() {
        let args = Args::from_toml_str("poll_interval_ms = 0").unwrap();
        assert_eq!(args.poll_interval(), None);
    }

    #[test]
    fn test_toml_overrides_and_unknown_keys() {
        let args = Args::from_toml_str(
            r#"
            model = "models/fod.onnx"
            task = "pose"
            nk = 17
            conf = 0.25
            image_format = "png"
            something_else = 1

            [[routes]]
            destination = 1
            source = 4
            "#,
        )
        .unwrap();
        assert_eq!(args.model, "models/fod.onnx");
        assert_eq!(args.task, YOLOTask::Pose);
        assert_eq!(args.nk, Some(17));
        assert_eq!(args.conf, 0.25);
        assert_eq!(args.image_format, EncodeFormat::Png);
        assert_eq!(
            args.routes,
            vec![Route {
                destination: 1,
                source: 4
            }]
        );
        // untouched keys keep their defaults
        assert_eq!(args.iou, 0.5);
    }

    #[test]
    fn test_rejects_inverted_batch_bounds() {
        let err = Args::from_toml_str("batch_min = 4\nbatch = 3\nbatch_max = 3").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_rejects_route_outside_destinations() {
        let err = Args::from_toml_str(
            "destinations = 2\n[[routes]]\ndestination = 2\nsource = 0",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_rejects_threshold_out_of_range() {
        assert!(Args::from_toml_str("iou = 1.5").is_err());
    }
}
