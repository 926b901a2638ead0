// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 静态图片输入源: 以固定帧率重复输出同一张图片
//! Still-image sources, used for demos and for driving the pipeline without cameras.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use image::RgbImage;

use crate::error::CaptureError;
use crate::input::{CameraDevice, DeviceFactory, RawFrame};
use crate::SourceId;

#[derive(Clone)]
enum StillSource {
    Path(PathBuf),
    Image(Arc<RgbImage>),
}

/// 静态图片工厂; 未登记的编号交给 fallback (通常是真实摄像头)
pub struct StillImageFactory {
    sources: HashMap<SourceId, StillSource>,
    interval: Duration,
    fallback: Option<Arc<dyn DeviceFactory>>,
}

impl StillImageFactory {
    pub fn new(fps: u32) -> Self {
        Self {
            sources: HashMap::new(),
            interval: Duration::from_secs_f64(1.0 / fps.max(1) as f64),
            fallback: None,
        }
    }

    pub fn with_path(mut self, id: SourceId, path: impl Into<PathBuf>) -> Self {
        self.sources.insert(id, StillSource::Path(path.into()));
        self
    }

    pub fn with_image(mut self, id: SourceId, image: RgbImage) -> Self {
        self.sources.insert(id, StillSource::Image(Arc::new(image)));
        self
    }

    pub fn with_fallback(mut self, fallback: Arc<dyn DeviceFactory>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

impl DeviceFactory for StillImageFactory {
    fn open(&self, id: SourceId) -> Result<Box<dyn CameraDevice>, CaptureError> {
        let image = match self.sources.get(&id) {
            Some(StillSource::Image(img)) => img.clone(),
            Some(StillSource::Path(path)) => {
                let img = image::open(path).map_err(|e| CaptureError::Open {
                    id,
                    reason: format!("{}: {}", path.display(), e),
                })?;
                Arc::new(img.to_rgb8())
            }
            None => {
                return match &self.fallback {
                    Some(fallback) => fallback.open(id),
                    None => Err(CaptureError::Open {
                        id,
                        reason: "no such device".into(),
                    }),
                }
            }
        };
        Ok(Box::new(StillCamera {
            image,
            interval: self.interval,
            first: true,
        }))
    }

    fn probe(&self, limit: u32) -> Vec<SourceId> {
        let mut ids: Vec<SourceId> = self.sources.keys().copied().collect();
        if let Some(fallback) = &self.fallback {
            ids.extend(fallback.probe(limit));
        }
        ids.sort_unstable();
        ids.dedup();
        ids
    }
}

struct StillCamera {
    image: Arc<RgbImage>,
    interval: Duration,
    first: bool,
}

impl CameraDevice for StillCamera {
    fn grab(&mut self) -> Result<RawFrame, CaptureError> {
        // 模拟采集帧率
        if !self.first {
            std::thread::sleep(self.interval);
        }
        self.first = false;
        Ok(RawFrame::new(
            self.image.width(),
            self.image.height(),
            self.image.as_raw().clone(),
        ))
    }
}
