// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//
// YOLOv8 模型
// 包含: 模型加载、执行提供者选择、模型信息解析

use anyhow::{bail, Result};
use ndarray::{Array, IxDyn};
use tracing::info;

use crate::models::{task_head, Model, ModelInfo};
use crate::{Args, Batch, OrtBackend, OrtConfig, OrtEP, YOLOTask};

/// YOLOv8 模型 (检测 / 姿态 / 分割)
pub struct YOLOv8 {
    engine: OrtBackend,
    info: ModelInfo,
    batch: u32,
    conf: f32,
    kconf: f32,
    iou: f32,
}

impl YOLOv8 {
    /// 从配置创建 YOLOv8 模型
    pub fn new(config: &Args) -> Result<Self> {
        // execution provider
        let ep = if config.trt {
            OrtEP::Trt(config.device_id)
        } else if config.cuda {
            OrtEP::CUDA(config.device_id)
        } else {
            OrtEP::CPU
        };

        // batch
        let batch = Batch {
            opt: config.batch,
            min: config.batch_min,
            max: config.batch_max,
        };

        // build ort engine
        let ort_args = OrtConfig {
            ep,
            batch,
            f: config.model.clone(),
            task: Some(config.task),
            trt_fp16: config.fp16,
            image_size: (Some(config.height), Some(config.width)),
        };
        let engine = OrtBackend::build(ort_args)?;

        // get batch, height, width, tasks, nc, nk, nm
        let (batch, height, width, task) = (
            engine.batch().opt,
            engine.height(),
            engine.width(),
            engine.task(),
        );
        let nc = resolve_nc(engine.nc(), config.nc)?;
        let (nk, nm) = match task {
            YOLOTask::Pose => (engine.nk().or(config.nk), None),
            YOLOTask::Segment => (None, engine.nm().or(config.nm)),
            YOLOTask::Detect => (None, None),
        };
        let head = task_head(task, nk, nm)?;

        if !engine.is_batch_dynamic() && batch < config.batch_max {
            bail!(
                "model has a fixed batch of {}, but batch_max is {}",
                batch,
                config.batch_max
            );
        }

        let fixed_batch = if engine.is_batch_dynamic() {
            None
        } else {
            Some(batch as usize)
        };

        // class names
        let names = engine.names().unwrap_or_default();

        Ok(Self {
            engine,
            info: ModelInfo {
                head,
                nc: nc as usize,
                width,
                height,
                names,
                fixed_batch,
            },
            batch,
            conf: config.conf,
            kconf: config.kconf,
            iou: config.iou,
        })
    }

    pub fn info(&self) -> &ModelInfo {
        &self.info
    }

    pub fn engine(&self) -> &OrtBackend {
        &self.engine
    }

    pub fn batch(&self) -> u32 {
        self.batch
    }

    pub fn width(&self) -> u32 {
        self.info.width
    }

    pub fn height(&self) -> u32 {
        self.info.height
    }
}

/// 类别数: 模型元数据优先, 其次配置; 0 视为缺失
fn resolve_nc(meta: Option<u32>, config: Option<u32>) -> Result<u32> {
    match meta.filter(|&n| n > 0).or(config) {
        Some(0) => bail!("num_classes must be positive, got 0"),
        Some(nc) => Ok(nc),
        None => bail!("Failed to get num_classes, make it explicit with `nc`"),
    }
}

impl Model for YOLOv8 {
    fn run(&mut self, xs: Array<f32, IxDyn>) -> Result<Vec<Array<f32, IxDyn>>> {
        self.engine.run(xs)
    }

    fn summary(&self) {
        let dynamic = |d: bool| if d { "Dynamic" } else { "Const" };
        info!(
            "\nSummary:\n\
            > Task: {:?}{}\n\
            > EP: {:?} {}\n\
            > Batch: {} ({}), Height: {} ({}), Width: {} ({})\n\
            > Head: {:?}, nc: {}, conf: {}, kconf: {}, iou: {}\n",
            self.engine.task(),
            match self.engine.author().zip(self.engine.version()) {
                Some((author, ver)) => format!(" ({} {})", author, ver),
                None => String::from(""),
            },
            self.engine.ep(),
            if let OrtEP::CPU = self.engine.ep() {
                ""
            } else {
                "(May still fall back to CPU)"
            },
            self.batch,
            dynamic(self.engine.is_batch_dynamic()),
            self.height(),
            dynamic(self.engine.is_height_dynamic()),
            self.width(),
            dynamic(self.engine.is_width_dynamic()),
            self.info.head,
            self.info.nc,
            self.conf,
            self.kconf,
            self.iou,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nc_prefers_metadata() {
        assert_eq!(resolve_nc(Some(3), Some(5)).unwrap(), 3);
    }

    #[test]
    fn test_nc_falls_back_to_config() {
        assert_eq!(resolve_nc(None, Some(5)).unwrap(), 5);
        // 元数据解析不出类别名时
        assert_eq!(resolve_nc(Some(0), Some(5)).unwrap(), 5);
    }

    #[test]
    fn test_nc_zero_or_missing_is_rejected() {
        assert!(resolve_nc(Some(0), None).is_err());
        assert!(resolve_nc(None, Some(0)).is_err());
        assert!(resolve_nc(None, None).is_err());
    }
}
