// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//
// ONNX Runtime 推理后端
// 包含: 执行提供者选择、模型元数据解析、批量前向推理

use anyhow::{bail, Context, Result};
use ndarray::{Array, IxDyn};
use ort::execution_providers::{
    CPUExecutionProvider, CUDAExecutionProvider, ExecutionProviderDispatch,
    TensorRTExecutionProvider,
};
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::Tensor;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// YOLO 任务类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum YOLOTask {
    #[default]
    Detect,
    Pose,
    Segment,
}

impl YOLOTask {
    /// 从模型元数据中的 task 字段解析
    pub fn from_metadata(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "detect" => Some(YOLOTask::Detect),
            "pose" => Some(YOLOTask::Pose),
            "segment" => Some(YOLOTask::Segment),
            _ => None,
        }
    }
}

/// 执行提供者 (Execution Provider)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrtEP {
    CPU,
    CUDA(u32),
    Trt(u32),
}

/// 批大小约束
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Batch {
    pub opt: u32,
    pub min: u32,
    pub max: u32,
}

impl Default for Batch {
    fn default() -> Self {
        Self {
            opt: 1,
            min: 1,
            max: 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrtConfig {
    pub f: String,
    pub task: Option<YOLOTask>,
    pub ep: OrtEP,
    pub trt_fp16: bool,
    pub batch: Batch,
    pub image_size: (Option<u32>, Option<u32>),
}

/// ONNX Runtime 会话及其输入/输出描述
pub struct OrtBackend {
    session: Session,
    ep: OrtEP,
    task: YOLOTask,
    batch: Batch,
    height: u32,
    width: u32,
    input_name: String,
    output_names: Vec<String>,
    names: Option<Vec<String>>,
    nc: Option<u32>,
    nk: Option<u32>,
    nm: Option<u32>,
    author: Option<String>,
    version: Option<String>,
    batch_dynamic: bool,
    height_dynamic: bool,
    width_dynamic: bool,
}

impl OrtBackend {
    pub fn build(args: OrtConfig) -> Result<Self> {
        let providers: Vec<ExecutionProviderDispatch> = match args.ep {
            OrtEP::Trt(device_id) => vec![
                TensorRTExecutionProvider::default()
                    .with_device_id(device_id as i32)
                    .with_fp16(args.trt_fp16)
                    .build(),
                CUDAExecutionProvider::default()
                    .with_device_id(device_id as i32)
                    .build(),
            ],
            OrtEP::CUDA(device_id) => vec![CUDAExecutionProvider::default()
                .with_device_id(device_id as i32)
                .build()],
            OrtEP::CPU => vec![CPUExecutionProvider::default().build()],
        };

        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_execution_providers(providers)?
            .commit_from_file(&args.f)
            .with_context(|| format!("failed to load ONNX model from {}", args.f))?;

        // 输入: images [batch, 3, height, width]
        let input = session
            .inputs
            .first()
            .context("model has no inputs")?;
        let input_name = input.name.clone();
        let dims = input
            .input_type
            .tensor_dimensions()
            .cloned()
            .context("model input is not a tensor")?;
        if dims.len() != 4 {
            bail!("expected a 4-d image input, model declares {:?}", dims);
        }
        let output_names: Vec<String> = session.outputs.iter().map(|o| o.name.clone()).collect();
        if output_names.is_empty() {
            bail!("model has no outputs");
        }
        // 分割模型第二个输出: protos [batch, nm, mh, mw]
        let nm = session
            .outputs
            .get(1)
            .and_then(|o| o.output_type.tensor_dimensions())
            .and_then(|d| d.get(1).copied())
            .filter(|&n| n > 0)
            .map(|n| n as u32);

        // 元数据 (ultralytics 导出时写入的自定义字段)
        let (names, nk, imgsz, meta_task, author, version) = {
            let metadata = session.metadata()?;
            let custom = |key: &str| metadata.custom(key).ok().flatten();
            (
                custom("names")
                    .map(|s| Self::parse_names(&s))
                    .filter(|names| !names.is_empty()),
                custom("kpt_shape").and_then(|s| Self::parse_ints(&s).first().copied()),
                custom("imgsz")
                    .map(|s| Self::parse_ints(&s))
                    .unwrap_or_default(),
                custom("task").and_then(|s| YOLOTask::from_metadata(&s)),
                custom("author"),
                custom("version"),
            )
        };
        if names.is_none() {
            warn!("model metadata carries no usable class names");
        }
        let nc = names.as_ref().map(|n| n.len() as u32).filter(|&n| n > 0);

        let task = match (args.task, meta_task) {
            (Some(task), Some(meta)) if task != meta => {
                warn!("configured task {:?} differs from model task {:?}, using configured", task, meta);
                task
            }
            (Some(task), _) => task,
            (None, Some(meta)) => meta,
            (None, None) => YOLOTask::Detect,
        };

        // batch: 动态维度取配置值
        let batch_dynamic = dims[0] <= 0;
        let batch = if batch_dynamic {
            args.batch
        } else {
            let n = dims[0] as u32;
            Batch {
                opt: n,
                min: n,
                max: n,
            }
        };

        // height/width: 固定维度 > 配置值 > 元数据 imgsz > 640
        let height_dynamic = dims[2] <= 0;
        let width_dynamic = dims[3] <= 0;
        let height = if height_dynamic {
            args.image_size
                .0
                .or(imgsz.first().copied())
                .unwrap_or(640)
        } else {
            dims[2] as u32
        };
        let width = if width_dynamic {
            args.image_size
                .1
                .or(imgsz.get(1).copied())
                .unwrap_or(640)
        } else {
            dims[3] as u32
        };

        info!(model = %args.f, ?task, height, width, "ONNX model loaded");

        Ok(Self {
            session,
            ep: args.ep,
            task,
            batch,
            height,
            width,
            input_name,
            output_names,
            names,
            nc,
            nk,
            nm,
            author,
            version,
            batch_dynamic,
            height_dynamic,
            width_dynamic,
        })
    }

    /// 执行一次批量前向推理, 输出顺序与模型声明一致
    pub fn run(&self, xs: Array<f32, IxDyn>) -> Result<Vec<Array<f32, IxDyn>>> {
        let input = Tensor::from_array(xs)?;
        let outputs = self
            .session
            .run(ort::inputs![self.input_name.as_str() => input]?)?;
        let mut ys = Vec::with_capacity(self.output_names.len());
        for name in self.output_names.iter() {
            let y = outputs[name.as_str()]
                .try_extract_tensor::<f32>()
                .with_context(|| format!("output {name} is not a f32 tensor"))?
                .into_owned();
            ys.push(y);
        }
        Ok(ys)
    }

    /// "{0: 'debris', 1: 'bolt'}" -> ["debris", "bolt"]
    pub(crate) fn parse_names(s: &str) -> Vec<String> {
        let Ok(re) = Regex::new(r#"(['"])([-()\w '"]+)(['"])"#) else {
            return Vec::new();
        };
        re.captures_iter(s)
            .map(|cap| cap[2].to_string())
            .collect()
    }

    /// "[17, 3]" -> [17, 3]
    pub(crate) fn parse_ints(s: &str) -> Vec<u32> {
        let Ok(re) = Regex::new(r"\d+") else {
            return Vec::new();
        };
        re.find_iter(s)
            .filter_map(|m| m.as_str().parse().ok())
            .collect()
    }

    pub fn ep(&self) -> &OrtEP {
        &self.ep
    }

    pub fn task(&self) -> YOLOTask {
        self.task
    }

    pub fn batch(&self) -> &Batch {
        &self.batch
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn names(&self) -> Option<Vec<String>> {
        self.names.clone()
    }

    pub fn nc(&self) -> Option<u32> {
        self.nc
    }

    pub fn nk(&self) -> Option<u32> {
        self.nk
    }

    pub fn nm(&self) -> Option<u32> {
        self.nm
    }

    pub fn author(&self) -> Option<&String> {
        self.author.as_ref()
    }

    pub fn version(&self) -> Option<&String> {
        self.version.as_ref()
    }

    pub fn is_batch_dynamic(&self) -> bool {
        self.batch_dynamic
    }

    pub fn is_height_dynamic(&self) -> bool {
        self.height_dynamic
    }

    pub fn is_width_dynamic(&self) -> bool {
        self.width_dynamic
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_names() {
        let names = OrtBackend::parse_names("{0: 'debris', 1: 'bolt', 2: \"bird\"}");
        assert_eq!(names, vec!["debris", "bolt", "bird"]);
    }

    #[test]
    fn test_parse_names_without_quoted_labels() {
        assert!(OrtBackend::parse_names("garbage").is_empty());
        assert!(OrtBackend::parse_names("{}").is_empty());
    }

    #[test]
    fn test_parse_kpt_shape() {
        assert_eq!(OrtBackend::parse_ints("[17, 3]"), vec![17, 3]);
        assert!(OrtBackend::parse_ints("[]").is_empty());
    }

    #[test]
    fn test_task_from_metadata() {
        assert_eq!(YOLOTask::from_metadata("pose"), Some(YOLOTask::Pose));
        assert_eq!(YOLOTask::from_metadata(" Segment "), Some(YOLOTask::Segment));
        assert_eq!(YOLOTask::from_metadata("classify"), None);
    }
}
