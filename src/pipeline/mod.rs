// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 多路推理流水线 (Pipeline Orchestrator)
//!
//! 单线程顺序循环, 每轮:
//! 采集 → 组批 → 预处理 (并行) → 推理 (一次) → 后处理 (并行) → 标注 (并行) → 路由
//!
//! 路由更新只在 Idle → Acquiring 时生效; 单帧失败只影响该帧, 整批失败只影响本轮。
pub mod batch;
pub mod inference;
pub mod routing;
pub mod router;
pub mod timing;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::{debug, error, info, warn};

pub use batch::{BatchAssembler, FrameBatch};
pub use inference::InferenceWorker;
pub use router::{EncodedOutcome, FrameResult, OutputRouter, RouteReport, SourceOutcome};
pub use routing::{RoutingHandle, RoutingTable, RoutingUpdate};
pub use timing::StageTimings;

use crate::control::{EventSink, ShellCommand, ShellEvent};
use crate::detection::{
    load_font, stack_batch, Annotator, Letterbox, Postprocessor, PreparedFrame, Preprocessor,
};
use crate::input::{DeviceFactory, Frame, ReadOutcome, SourceConfig, SourceManager, SourceStatus};
use crate::{Args, Detection, InferenceError, Model, ModelInfo, PipelineError, SourceId};
use timing::Stopwatch;

/// 未开始推流时等待命令的间隔
const IDLE_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Acquiring,
    Assembling,
    Preprocessing,
    Inferring,
    Postprocessing,
    Annotating,
    Routing,
}

/// 一轮的统计
#[derive(Debug, Clone, Default)]
pub struct IterationReport {
    pub routing_version: u64,
    pub batch_size: usize,
    pub deferred: Vec<SourceId>,
    pub inference_error: Option<InferenceError>,
    pub route: RouteReport,
    pub timings: StageTimings,
}

pub struct Orchestrator {
    state: PipelineState,
    routing: RoutingTable,
    updates_tx: Sender<RoutingUpdate>,
    updates_rx: Receiver<RoutingUpdate>,
    sources: SourceManager,
    assembler: BatchAssembler,
    preprocessor: Preprocessor,
    postprocessor: Postprocessor,
    annotator: Annotator,
    router: OutputRouter,
    engine: InferenceWorker,
    pool: ThreadPool,
    fixed_batch: Option<usize>,
    shutdown: Arc<AtomicBool>,
    probe_limit: u32,
    poll_interval: Option<Duration>,
    profile: bool,
    iterations: u64,
}

impl Orchestrator {
    pub fn new(
        args: &Args,
        info: ModelInfo,
        model: Box<dyn Model>,
        factory: Arc<dyn DeviceFactory>,
    ) -> Result<Self, PipelineError> {
        args.validate()?;

        let pool = ThreadPoolBuilder::new()
            .thread_name(|i| format!("fod-worker-{}", i))
            .build()?;
        let engine = InferenceWorker::spawn(model, args.inference_timeout())?;
        let font = if args.annotate {
            load_font(args.font.as_deref())
        } else {
            None
        };
        let (updates_tx, updates_rx) = unbounded();

        info!(
            destinations = args.destinations,
            workers = pool.current_num_threads(),
            "🚀 pipeline ready"
        );

        Ok(Self {
            state: PipelineState::Idle,
            routing: RoutingTable::from_routes(args.destinations, &args.routes),
            updates_tx,
            updates_rx,
            sources: SourceManager::new(factory, SourceConfig::from(args)),
            assembler: BatchAssembler::new(args.batch_min as usize, args.batch_max as usize),
            preprocessor: Preprocessor::new(info.width, info.height),
            postprocessor: Postprocessor::new(info.head, info.nc, args.conf, args.iou, args.kconf),
            annotator: Annotator::new(args.annotate, info.names, font),
            router: OutputRouter::new(args.image_format),
            engine,
            pool,
            fixed_batch: info.fixed_batch,
            shutdown: Arc::new(AtomicBool::new(false)),
            probe_limit: args.probe_limit,
            poll_interval: args.poll_interval(),
            profile: args.profile,
            iterations: 0,
        })
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn routing(&self) -> &RoutingTable {
        &self.routing
    }

    /// 外壳侧的路由更新入口
    pub fn routing_handle(&self) -> RoutingHandle {
        RoutingHandle::new(self.updates_tx.clone())
    }

    /// 置位后循环在下一个 Idle 时退出
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    pub fn health(&self) -> Vec<(SourceId, SourceStatus)> {
        self.sources.health()
    }

    pub fn iterations(&self) -> u64 {
        self.iterations
    }

    /// 枚举可用摄像头并通知外壳
    pub fn poll_sources(&self, sink: &mut dyn EventSink) -> Vec<SourceId> {
        let ids = self.sources.poll(self.probe_limit);
        info!("available cameras: {:?}", ids);
        sink.emit(ShellEvent::AvailableCameras { ids: ids.clone() });
        ids
    }

    /// 应用排队的路由更新; 无效更新向对应窗口发送错误
    fn apply_routing_updates(&mut self, sink: &mut dyn EventSink) {
        for update in routing::drain_updates(&self.updates_rx) {
            match self.routing.set(update.destination, update.source) {
                Ok(true) => info!(
                    destination = update.destination,
                    source = ?update.source,
                    version = self.routing.version(),
                    "routing updated"
                ),
                Ok(false) => {}
                Err(e) => {
                    warn!("{}", e);
                    sink.emit(ShellEvent::Error {
                        destination: update.destination,
                        reason: e.to_string(),
                    });
                }
            }
        }
    }

    /// 执行一轮
    pub fn step(&mut self, sink: &mut dyn EventSink) -> IterationReport {
        let mut watch = Stopwatch::start();
        let mut report = IterationReport::default();

        // Idle → Acquiring: 应用路由更新, 取快照, 同步摄像头
        self.apply_routing_updates(sink);
        let snapshot = self.routing.clone();
        let referenced = snapshot.referenced_sources();
        report.routing_version = snapshot.version();
        self.state = PipelineState::Acquiring;

        let mut outcomes: BTreeMap<SourceId, SourceOutcome> = BTreeMap::new();
        for (id, e) in self.sources.sync(&referenced) {
            outcomes.insert(id, SourceOutcome::Failed(e.to_string()));
        }
        let order: Vec<SourceId> = self
            .assembler
            .poll_order(&referenced)
            .into_iter()
            .filter(|id| !outcomes.contains_key(id))
            .collect();
        let mut frames: Vec<Frame> = Vec::with_capacity(order.len());
        for (id, outcome) in self.sources.read_many(&order) {
            match outcome {
                ReadOutcome::Frame(frame) => frames.push(frame),
                ReadOutcome::NotReady => {
                    outcomes.insert(id, SourceOutcome::NoData);
                }
                ReadOutcome::Errored(reason) => {
                    outcomes.insert(id, SourceOutcome::Failed(reason));
                }
            }
        }
        report.timings.acquire = watch.lap();

        // Assembling
        self.state = PipelineState::Assembling;
        let batch = self.assembler.assemble(frames);
        for id in batch.deferred.iter() {
            outcomes.insert(*id, SourceOutcome::NoData);
        }
        report.batch_size = batch.len();
        report.deferred = batch.deferred.clone();
        report.timings.assemble = watch.lap();

        if !batch.is_empty() {
            if let Err(e) = self.process(batch, &mut outcomes, &mut report, &mut watch) {
                error!("batch failed: {}", e);
                self.state = PipelineState::Routing;
                report.route = self.router.route_batch_failure(&snapshot, &e.to_string(), sink);
                report.inference_error = Some(e);
                return self.finish(report, &mut watch);
            }
        }

        // Routing
        self.state = PipelineState::Routing;
        let router = self.router;
        let encoded = self.pool.install(|| router.encode(outcomes));
        report.route = self.router.emit(&snapshot, &encoded, sink);
        self.finish(report, &mut watch)
    }

    /// 预处理 → 推理 → 后处理 → 标注; 推理失败时返回整批错误
    fn process(
        &mut self,
        batch: FrameBatch,
        outcomes: &mut BTreeMap<SourceId, SourceOutcome>,
        report: &mut IterationReport,
        watch: &mut Stopwatch,
    ) -> Result<(), InferenceError> {
        // Preprocessing
        self.state = PipelineState::Preprocessing;
        let frames = batch.frames;
        let preprocessor = self.preprocessor;
        let prepared = self.pool.install(|| preprocessor.prepare_batch(&frames));
        let mut ready: Vec<(Frame, PreparedFrame)> = Vec::with_capacity(frames.len());
        for (frame, p) in frames.into_iter().zip(prepared) {
            match p {
                Ok(p) => ready.push((frame, p)),
                Err(e) => {
                    warn!(camera = frame.source, "{}", e);
                    outcomes.insert(frame.source, SourceOutcome::NoData);
                }
            }
        }
        report.timings.preprocess = watch.lap();
        if ready.is_empty() {
            return Ok(());
        }

        // Inferring
        self.state = PipelineState::Inferring;
        let xs = {
            let refs: Vec<&PreparedFrame> = ready.iter().map(|(_, p)| p).collect();
            stack_batch(
                &refs,
                self.preprocessor.width(),
                self.preprocessor.height(),
                self.fixed_batch,
            )
        };
        let outputs = self.engine.infer(xs);
        report.timings.infer = watch.lap();
        let outputs = outputs?;

        // Postprocessing
        self.state = PipelineState::Postprocessing;
        let letterboxes: Vec<Letterbox> = ready.iter().map(|(_, p)| p.letterbox).collect();
        let postprocessor = &self.postprocessor;
        let decoded = self
            .pool
            .install(|| postprocessor.decode_batch(&outputs, &letterboxes));
        let detections: Vec<Vec<Detection>> = decoded
            .into_iter()
            .zip(ready.iter())
            .map(|(d, (frame, _))| {
                d.unwrap_or_else(|e| {
                    warn!(camera = frame.source, "{}", e);
                    Vec::new()
                })
            })
            .collect();
        report.timings.postprocess = watch.lap();

        // Annotating
        self.state = PipelineState::Annotating;
        let annotator = &self.annotator;
        let images = {
            let items: Vec<(&Frame, &[Detection])> = ready
                .iter()
                .zip(detections.iter())
                .map(|((frame, _), dets)| (frame, dets.as_slice()))
                .collect();
            self.pool.install(|| annotator.annotate_batch(&items))
        };
        for (((frame, _), detections), image) in ready.into_iter().zip(detections).zip(images) {
            let source = frame.source;
            match image {
                Ok(image) => {
                    outcomes.insert(
                        source,
                        SourceOutcome::Ready(FrameResult {
                            frame,
                            detections,
                            image,
                        }),
                    );
                }
                Err(e) => {
                    warn!(camera = source, "{}", e);
                    outcomes.insert(source, SourceOutcome::NoData);
                }
            }
        }
        report.timings.annotate = watch.lap();
        Ok(())
    }

    fn finish(&mut self, mut report: IterationReport, watch: &mut Stopwatch) -> IterationReport {
        report.timings.route = watch.lap();
        self.state = PipelineState::Idle;
        self.iterations += 1;
        debug!(
            iteration = self.iterations,
            batch = report.batch_size,
            "{}",
            report.timings
        );
        if self.profile {
            info!(
                "[Iteration {}] batch {}: {}",
                self.iterations, report.batch_size, report.timings
            );
        }
        report
    }

    fn handle_command(&mut self, cmd: ShellCommand, streaming: &mut bool, sink: &mut dyn EventSink) {
        debug!("command: {:?}", cmd);
        match cmd {
            ShellCommand::StartStreaming => {
                if !*streaming {
                    info!("▶️ streaming started");
                }
                *streaming = true;
            }
            ShellCommand::UpdateRouting {
                destination,
                source,
            } => {
                let _ = self.updates_tx.send(RoutingUpdate {
                    destination,
                    source,
                });
                // 未推流时处于 Idle, 立即生效
                if !*streaming {
                    self.apply_routing_updates(sink);
                }
            }
            ShellCommand::PollSources => {
                self.poll_sources(sink);
            }
            ShellCommand::Shutdown => {
                self.shutdown.store(true, Ordering::SeqCst);
            }
        }
    }

    /// 主循环: 处理命令, 定期枚举摄像头, 推流时逐轮执行, 收到关闭信号后清理退出
    pub fn serve(
        &mut self,
        commands: &Receiver<ShellCommand>,
        sink: &mut dyn EventSink,
        autostart: bool,
    ) {
        let mut streaming = false;
        let mut last_poll = Instant::now();
        if autostart {
            self.handle_command(ShellCommand::StartStreaming, &mut streaming, sink);
        }

        while !self.shutdown.load(Ordering::SeqCst) {
            let first = if streaming {
                match commands.try_recv() {
                    Ok(cmd) => Some(cmd),
                    Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
                }
            } else {
                match commands.recv_timeout(IDLE_POLL) {
                    Ok(cmd) => Some(cmd),
                    Err(RecvTimeoutError::Timeout) => None,
                    Err(RecvTimeoutError::Disconnected) => {
                        // 不会再有 StartStreaming
                        self.shutdown.store(true, Ordering::SeqCst);
                        None
                    }
                }
            };
            let pending: Vec<ShellCommand> = first.into_iter().chain(commands.try_iter()).collect();
            for cmd in pending {
                self.handle_command(cmd, &mut streaming, sink);
            }

            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }
            // Idle 边界: 定期重新枚举摄像头
            if let Some(interval) = self.poll_interval {
                if last_poll.elapsed() >= interval {
                    self.poll_sources(sink);
                    last_poll = Instant::now();
                }
            }
            if streaming {
                self.step(sink);
            }
        }

        self.stop(sink);
    }

    /// 清理: 每个已映射窗口收到最后一次 NoData, 然后关闭所有摄像头
    pub fn stop(&mut self, sink: &mut dyn EventSink) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.router.drain(&self.routing, sink);
        self.sources.close_all();
        self.state = PipelineState::Idle;
        info!("🛑 pipeline stopped after {} iterations", self.iterations);
    }
}
