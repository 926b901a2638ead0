// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 摄像头源管理 (Camera Source Manager)
//!
//! 每个打开的摄像头有独立的读取线程, 通道容量为 1, 只保留最新一帧。
//! 一轮采集内所有读取共享同一截止时间, 卡住的摄像头不会拖慢其它摄像头。

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use tracing::{debug, info, warn};

use crate::error::CaptureError;
use crate::input::{
    CameraDevice, DeviceFactory, Frame, Interrupt, RawFrame, ReadOutcome, SourceStatus,
};
use crate::{Args, SourceId};

/// 读取失败后的等待时间
const READ_RETRY_DELAY: Duration = Duration::from_millis(50);

type Grabbed = Result<RawFrame, CaptureError>;

#[derive(Debug, Clone, Copy)]
pub struct SourceConfig {
    pub acquire_timeout: Duration,
    pub max_read_failures: u32,
    pub reopen_interval: Duration,
}

impl From<&Args> for SourceConfig {
    fn from(args: &Args) -> Self {
        Self {
            acquire_timeout: args.acquire_timeout(),
            max_read_failures: args.max_read_failures,
            reopen_interval: args.reopen_interval(),
        }
    }
}

/// 读取线程句柄
struct Reader {
    rx: Receiver<Grabbed>,
    stop: Arc<AtomicBool>,
    interrupt: Option<Interrupt>,
    handle: Option<JoinHandle<()>>,
}

impl Reader {
    fn spawn(id: SourceId, mut device: Box<dyn CameraDevice>) -> std::io::Result<Self> {
        let (tx, rx) = bounded::<Grabbed>(1);
        let drain = rx.clone();
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();
        let interrupt = device.interrupter();
        let handle = thread::Builder::new()
            .name(format!("cam-reader-{id}"))
            .spawn(move || {
                while !stop_flag.load(Ordering::Relaxed) {
                    let grabbed = device.grab();
                    if stop_flag.load(Ordering::Relaxed) {
                        break;
                    }
                    let failed = grabbed.is_err();
                    if !push_latest(&tx, &drain, grabbed) {
                        break;
                    }
                    if failed {
                        thread::sleep(READ_RETRY_DELAY);
                    }
                }
                debug!(camera = id, "reader stopped");
            })?;
        Ok(Self {
            rx,
            stop,
            interrupt,
            handle: Some(handle),
        })
    }

    fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        // 唤醒阻塞中的 grab, 线程随后自行退出并释放设备
        if let Some(interrupt) = self.interrupt.take() {
            interrupt();
        }
        if let Some(handle) = self.handle.take() {
            if handle.is_finished() {
                let _ = handle.join();
            }
        }
    }
}

/// 发送最新值; 通道已满时丢弃旧值。接收端关闭时返回 false
fn push_latest(tx: &Sender<Grabbed>, drain: &Receiver<Grabbed>, value: Grabbed) -> bool {
    let mut value = value;
    loop {
        match tx.try_send(value) {
            Ok(()) => return true,
            Err(TrySendError::Full(v)) => {
                let _ = drain.try_recv();
                value = v;
            }
            Err(TrySendError::Disconnected(_)) => return false,
        }
    }
}

struct SourceEntry {
    status: SourceStatus,
    reader: Option<Reader>,
    seq: u64,
    failures: u32,
    errored_at: Option<Instant>,
}

impl SourceEntry {
    fn errored(reason: String) -> Self {
        Self {
            status: SourceStatus::Errored(reason),
            reader: None,
            seq: 0,
            failures: 0,
            errored_at: Some(Instant::now()),
        }
    }
}

pub struct SourceManager {
    factory: Arc<dyn DeviceFactory>,
    sources: BTreeMap<SourceId, SourceEntry>,
    config: SourceConfig,
}

impl SourceManager {
    pub fn new(factory: Arc<dyn DeviceFactory>, config: SourceConfig) -> Self {
        Self {
            factory,
            sources: BTreeMap::new(),
            config,
        }
    }

    pub fn config(&self) -> &SourceConfig {
        &self.config
    }

    /// 打开摄像头; 已打开时不做任何事
    pub fn open(&mut self, id: SourceId) -> Result<(), CaptureError> {
        if let Some(entry) = self.sources.get(&id) {
            if entry.status == SourceStatus::Open {
                return Ok(());
            }
        }
        let seq = self.sources.get(&id).map(|e| e.seq).unwrap_or(0);
        match self.spawn_reader(id) {
            Ok(reader) => {
                self.sources.insert(
                    id,
                    SourceEntry {
                        status: SourceStatus::Open,
                        reader: Some(reader),
                        seq,
                        failures: 0,
                        errored_at: None,
                    },
                );
                Ok(())
            }
            Err(e) => {
                warn!(camera = id, "{}", e);
                let mut entry = SourceEntry::errored(e.to_string());
                entry.seq = seq;
                self.sources.insert(id, entry);
                Err(e)
            }
        }
    }

    fn spawn_reader(&self, id: SourceId) -> Result<Reader, CaptureError> {
        let device = self.factory.open(id)?;
        Reader::spawn(id, device).map_err(|e| CaptureError::Open {
            id,
            reason: format!("failed to spawn reader thread: {e}"),
        })
    }

    /// 关闭摄像头并释放设备
    pub fn close(&mut self, id: SourceId) {
        if let Some(mut entry) = self.sources.remove(&id) {
            if let Some(reader) = entry.reader.as_mut() {
                reader.stop();
            }
            info!(camera = id, "camera closed");
        }
    }

    /// 打开新引用的摄像头, 关闭不再引用的摄像头; 返回打开失败的列表
    pub fn sync(&mut self, referenced: &BTreeSet<SourceId>) -> Vec<(SourceId, CaptureError)> {
        let stale: Vec<SourceId> = self
            .sources
            .keys()
            .filter(|id| !referenced.contains(id))
            .copied()
            .collect();
        for id in stale {
            self.close(id);
        }
        let mut failures = Vec::new();
        for &id in referenced.iter() {
            if !self.sources.contains_key(&id) {
                if let Err(e) = self.open(id) {
                    failures.push((id, e));
                }
            }
        }
        failures
    }

    /// 读取单个摄像头的最新帧, 最多等待 acquire_timeout
    pub fn read(&mut self, id: SourceId) -> ReadOutcome {
        let deadline = Instant::now() + self.config.acquire_timeout;
        self.read_until(id, deadline)
    }

    /// 读取多个摄像头, 共享同一截止时间; 结果顺序与 ids 一致
    pub fn read_many(&mut self, ids: &[SourceId]) -> Vec<(SourceId, ReadOutcome)> {
        let deadline = Instant::now() + self.config.acquire_timeout;
        ids.iter()
            .map(|&id| (id, self.read_until(id, deadline)))
            .collect()
    }

    fn read_until(&mut self, id: SourceId, deadline: Instant) -> ReadOutcome {
        self.maybe_reopen(id);

        let Some(entry) = self.sources.get_mut(&id) else {
            return ReadOutcome::Errored(CaptureError::NotOpen { id }.to_string());
        };
        let reader = match (&entry.status, entry.reader.as_ref()) {
            (SourceStatus::Open, Some(reader)) => reader,
            (SourceStatus::Errored(reason), _) => return ReadOutcome::Errored(reason.clone()),
            _ => return ReadOutcome::Errored(CaptureError::NotOpen { id }.to_string()),
        };

        let received = reader.rx.recv_deadline(deadline);
        match received {
            Ok(Ok(raw)) => {
                entry.failures = 0;
                entry.seq += 1;
                ReadOutcome::Frame(Frame::from_raw(id, entry.seq, raw))
            }
            Ok(Err(e)) => self.record_failure(id, e.to_string()),
            Err(RecvTimeoutError::Timeout) => ReadOutcome::NotReady,
            Err(RecvTimeoutError::Disconnected) => self.record_failure(
                id,
                CaptureError::Read {
                    id,
                    reason: "reader stopped".into(),
                }
                .to_string(),
            ),
        }
    }

    /// 连续失败达到上限后标记为 Errored 并释放设备
    fn record_failure(&mut self, id: SourceId, reason: String) -> ReadOutcome {
        let max = self.config.max_read_failures;
        if let Some(entry) = self.sources.get_mut(&id) {
            entry.failures += 1;
            warn!(camera = id, failures = entry.failures, "{}", reason);
            if entry.failures >= max {
                if let Some(mut reader) = entry.reader.take() {
                    reader.stop();
                }
                entry.status = SourceStatus::Errored(reason.clone());
                entry.errored_at = Some(Instant::now());
                warn!(camera = id, "camera marked errored after {} failures", max);
            }
        }
        ReadOutcome::Errored(reason)
    }

    fn maybe_reopen(&mut self, id: SourceId) {
        let due = match self.sources.get(&id) {
            Some(SourceEntry {
                status: SourceStatus::Errored(_),
                errored_at: Some(at),
                ..
            }) => at.elapsed() >= self.config.reopen_interval,
            _ => false,
        };
        if due {
            info!(camera = id, "reopening camera");
            let _ = self.open(id);
        }
    }

    pub fn status(&self, id: SourceId) -> SourceStatus {
        self.sources
            .get(&id)
            .map(|e| e.status.clone())
            .unwrap_or(SourceStatus::Closed)
    }

    /// 每个已知摄像头的状态
    pub fn health(&self) -> Vec<(SourceId, SourceStatus)> {
        self.sources
            .iter()
            .map(|(id, e)| (*id, e.status.clone()))
            .collect()
    }

    /// 可用摄像头: 枚举结果 + 已打开的摄像头
    pub fn poll(&self, limit: u32) -> Vec<SourceId> {
        let mut ids = self.factory.probe(limit);
        ids.extend(
            self.sources
                .iter()
                .filter(|(_, e)| e.status == SourceStatus::Open)
                .map(|(id, _)| *id),
        );
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    pub fn close_all(&mut self) {
        let ids: Vec<SourceId> = self.sources.keys().copied().collect();
        for id in ids {
            self.close(id);
        }
    }
}

impl Drop for SourceManager {
    fn drop(&mut self) {
        self.close_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    /// 读取 `fail_after` 帧后持续失败
    struct FlakyDevice {
        grabbed: u32,
        fail_after: u32,
    }

    impl CameraDevice for FlakyDevice {
        fn grab(&mut self) -> Result<RawFrame, CaptureError> {
            thread::sleep(Duration::from_millis(2));
            self.grabbed += 1;
            if self.grabbed > self.fail_after {
                return Err(CaptureError::Read {
                    id: 0,
                    reason: "unplugged".into(),
                });
            }
            Ok(RawFrame::new(2, 2, vec![0; 12]))
        }
    }

    struct FlakyFactory {
        fail_after: u32,
        opened: AtomicU32,
    }

    impl DeviceFactory for FlakyFactory {
        fn open(&self, id: SourceId) -> Result<Box<dyn CameraDevice>, CaptureError> {
            if id == 9 {
                return Err(CaptureError::Open {
                    id,
                    reason: "no such device".into(),
                });
            }
            self.opened.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FlakyDevice {
                grabbed: 0,
                fail_after: self.fail_after,
            }))
        }

        fn probe(&self, _limit: u32) -> Vec<SourceId> {
            vec![0, 1]
        }
    }

    fn manager(fail_after: u32, reopen: Duration) -> SourceManager {
        SourceManager::new(
            Arc::new(FlakyFactory {
                fail_after,
                opened: AtomicU32::new(0),
            }),
            SourceConfig {
                acquire_timeout: Duration::from_millis(200),
                max_read_failures: 2,
                reopen_interval: reopen,
            },
        )
    }

    #[test]
    fn test_sequence_numbers_increase() {
        let mut m = manager(u32::MAX, Duration::from_secs(1));
        m.open(0).unwrap();
        let seqs: Vec<u64> = (0..3)
            .filter_map(|_| match m.read(0) {
                ReadOutcome::Frame(f) => Some(f.seq),
                _ => None,
            })
            .collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[test]
    fn test_open_failure_is_reported_per_source() {
        let mut m = manager(u32::MAX, Duration::from_secs(60));
        assert!(m.open(9).is_err());
        assert!(matches!(m.status(9), SourceStatus::Errored(_)));
        assert!(matches!(m.read(9), ReadOutcome::Errored(_)));
    }

    #[test]
    fn test_persistent_failure_marks_errored_then_reopens() {
        let mut m = manager(0, Duration::from_millis(10));
        m.open(0).unwrap();
        assert!(matches!(m.read(0), ReadOutcome::Errored(_)));
        assert!(matches!(m.read(0), ReadOutcome::Errored(_)));
        assert!(matches!(m.status(0), SourceStatus::Errored(_)));

        thread::sleep(Duration::from_millis(20));
        // 到期后重新打开
        let _ = m.read(0);
        assert_eq!(m.health().len(), 1);
    }

    #[test]
    fn test_sync_closes_unreferenced() {
        let mut m = manager(u32::MAX, Duration::from_secs(1));
        let failures = m.sync(&BTreeSet::from([0, 1, 9]));
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, 9);
        m.sync(&BTreeSet::from([1]));
        assert_eq!(m.status(0), SourceStatus::Closed);
        assert_eq!(m.status(1), SourceStatus::Open);
    }

    /// grab 一直阻塞, 直到被中断
    struct BlockingDevice {
        wake: Receiver<()>,
        waker: Arc<std::sync::Mutex<Option<Sender<()>>>>,
        released: Arc<AtomicBool>,
    }

    impl CameraDevice for BlockingDevice {
        fn grab(&mut self) -> Result<RawFrame, CaptureError> {
            let _ = self.wake.recv();
            Err(CaptureError::Read {
                id: 0,
                reason: "interrupted".into(),
            })
        }

        fn interrupter(&self) -> Option<Interrupt> {
            let waker = self.waker.clone();
            Some(Arc::new(move || {
                if let Ok(mut waker) = waker.lock() {
                    waker.take();
                }
            }))
        }
    }

    impl Drop for BlockingDevice {
        fn drop(&mut self) {
            self.released.store(true, Ordering::SeqCst);
        }
    }

    struct BlockingFactory {
        released: Arc<AtomicBool>,
    }

    impl DeviceFactory for BlockingFactory {
        fn open(&self, _id: SourceId) -> Result<Box<dyn CameraDevice>, CaptureError> {
            let (tx, rx) = bounded(0);
            Ok(Box::new(BlockingDevice {
                wake: rx,
                waker: Arc::new(std::sync::Mutex::new(Some(tx))),
                released: self.released.clone(),
            }))
        }

        fn probe(&self, _limit: u32) -> Vec<SourceId> {
            Vec::new()
        }
    }

    #[test]
    fn test_close_interrupts_a_blocked_read() {
        let released = Arc::new(AtomicBool::new(false));
        let mut m = SourceManager::new(
            Arc::new(BlockingFactory {
                released: released.clone(),
            }),
            SourceConfig {
                acquire_timeout: Duration::from_millis(20),
                max_read_failures: 2,
                reopen_interval: Duration::from_secs(60),
            },
        );
        m.open(0).unwrap();
        assert!(matches!(m.read(0), ReadOutcome::NotReady));

        m.close(0);
        let deadline = Instant::now() + Duration::from_secs(1);
        while !released.load(Ordering::SeqCst) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(released.load(Ordering::SeqCst), "device still held by reader");
        assert_eq!(m.status(0), SourceStatus::Closed);
    }

    #[test]
    fn test_poll_merges_open_sources() {
        let mut m = manager(u32::MAX, Duration::from_secs(1));
        m.open(4).unwrap();
        assert_eq!(m.poll(8), vec![0, 1, 4]);
    }
}
