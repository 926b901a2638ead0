// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
/// 异物检测哨兵 (FOD Sentinel)
///
/// 多路摄像头异物检测
///
/// 外壳桥接:
/// 1. stdin:  JSON 行命令 (start_streaming / update_routing / poll_sources / shutdown)
/// 2. stdout: JSON 行事件 (image / error / no_data / available_cameras)
/// 3. stderr: 日志
use std::io::BufReader;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use fod_sentinel::control::{spawn_command_reader, JsonLinesSink};
use fod_sentinel::input::{DeviceFactory, FfmpegFactory, StillImageFactory};
use fod_sentinel::{telemetry, Args, Model, Orchestrator, YOLOv8};
use tracing::{info, warn};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// 哨兵参数
#[derive(Parser, Debug)]
#[command(author, version, about = "多路摄像头异物检测", long_about = None)]
struct Cli {
    /// 配置文件
    #[arg(short, long, default_value = "./model_args.toml")]
    config: PathBuf,

    /// ONNX 模型路径 (覆盖配置)
    #[arg(short, long)]
    model: Option<String>,

    /// 不等待 start_streaming 命令
    #[arg(long)]
    autostart: bool,

    /// 强制使用 CPU
    #[arg(long)]
    cpu: bool,

    /// 打印每轮各阶段耗时
    #[arg(long)]
    profile: bool,

    /// debug 日志
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    telemetry::init(cli.verbose);

    let mut args = Args::load(&cli.config)
        .with_context(|| format!("invalid configuration in {}", cli.config.display()))?;
    if let Some(model) = cli.model {
        args.model = model;
    }
    if cli.cpu {
        args.cuda = false;
        args.trt = false;
    }
    args.profile |= cli.profile;

    info!("🚀 FOD sentinel starting");
    info!("📦 model: {}", args.model);

    // 模型加载失败是致命错误
    let model = YOLOv8::new(&args).context("failed to load model")?;
    model.summary();
    let model_info = model.info().clone();

    let cameras: Arc<dyn DeviceFactory> = Arc::new(FfmpegFactory::new(
        args.capture_width,
        args.capture_height,
        args.capture_fps,
    ));
    let factory: Arc<dyn DeviceFactory> = if args.still_images.is_empty() {
        cameras
    } else {
        let mut still = StillImageFactory::new(args.capture_fps).with_fallback(cameras);
        for s in args.still_images.iter() {
            info!("🖼️ camera {} served from {}", s.source, s.path.display());
            still = still.with_path(s.source, s.path.clone());
        }
        Arc::new(still)
    };

    let mut pipeline = Orchestrator::new(&args, model_info, Box::new(model), factory)?;

    // Ctrl+C → 优雅退出
    let shutdown = pipeline.shutdown_flag();
    if let Err(err) = ctrlc::set_handler(move || {
        shutdown.store(true, Ordering::SeqCst);
    }) {
        warn!("Failed to install Ctrl+C handler: {err}");
    }

    let (tx, rx) = crossbeam_channel::unbounded();
    spawn_command_reader(BufReader::new(std::io::stdin()), tx)
        .context("failed to start command reader")?;

    let mut sink = JsonLinesSink::new(std::io::stdout().lock());
    pipeline.serve(&rx, &mut sink, cli.autostart);

    info!("👋 bye");
    Ok(())
}
