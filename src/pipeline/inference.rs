// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 推理线程 (Inference Engine)
//!
//! 模型在独立线程上运行, 同一时间最多一个请求。
//! 超时的请求不会取消, 其结果在之后按请求编号丢弃; 仍在执行时新请求直接返回 Busy。

use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use ndarray::{Array, IxDyn};
use tracing::{debug, warn};

use crate::{InferenceError, Model};

type Outputs = Vec<Array<f32, IxDyn>>;

struct Request {
    id: u64,
    xs: Array<f32, IxDyn>,
}

struct Response {
    id: u64,
    result: Result<Outputs, String>,
}

pub struct InferenceWorker {
    tx: Option<Sender<Request>>,
    rx: Receiver<Response>,
    next_id: u64,
    in_flight: Option<u64>,
    timeout: Duration,
    handle: Option<JoinHandle<()>>,
}

impl InferenceWorker {
    pub fn spawn(mut model: Box<dyn Model>, timeout: Duration) -> std::io::Result<Self> {
        let (tx, requests) = bounded::<Request>(1);
        let (responses, rx) = bounded::<Response>(1);
        let handle = thread::Builder::new()
            .name("inference".into())
            .spawn(move || {
                for req in requests.iter() {
                    let result = model.run(req.xs).map_err(|e| format!("{e:#}"));
                    if responses.send(Response { id: req.id, result }).is_err() {
                        break;
                    }
                }
                debug!("inference thread stopped");
            })?;
        Ok(Self {
            tx: Some(tx),
            rx,
            next_id: 0,
            in_flight: None,
            timeout,
            handle: Some(handle),
        })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight.is_some()
    }

    /// 一次批量前向推理, 最多等待 timeout
    pub fn infer(&mut self, xs: Array<f32, IxDyn>) -> Result<Outputs, InferenceError> {
        // 上一次超时的请求是否已经返回
        if let Some(pending) = self.in_flight {
            match self.rx.try_recv() {
                Ok(resp) => {
                    debug!(request = resp.id, pending, "discarding stale inference result");
                    self.in_flight = None;
                }
                Err(TryRecvError::Empty) => return Err(InferenceError::Busy),
                Err(TryRecvError::Disconnected) => return Err(InferenceError::Disconnected),
            }
        }

        let tx = self.tx.as_ref().ok_or(InferenceError::Disconnected)?;
        self.next_id += 1;
        let id = self.next_id;
        tx.send(Request { id, xs })
            .map_err(|_| InferenceError::Disconnected)?;
        self.in_flight = Some(id);

        let deadline = Instant::now() + self.timeout;
        loop {
            match self.rx.recv_deadline(deadline) {
                Ok(resp) if resp.id == id => {
                    self.in_flight = None;
                    return resp.result.map_err(InferenceError::Run);
                }
                Ok(resp) => {
                    debug!(request = resp.id, "discarding stale inference result");
                }
                Err(RecvTimeoutError::Timeout) => {
                    warn!(request = id, "inference timed out after {:?}", self.timeout);
                    return Err(InferenceError::Timeout(self.timeout));
                }
                Err(RecvTimeoutError::Disconnected) => {
                    self.in_flight = None;
                    return Err(InferenceError::Disconnected);
                }
            }
        }
    }
}

impl Drop for InferenceWorker {
    fn drop(&mut self) {
        // 关闭请求通道, 线程处理完当前请求后退出
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            if self.in_flight.is_none() {
                let _ = handle.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    struct Doubler;

    impl Model for Doubler {
        fn run(&mut self, xs: Array<f32, IxDyn>) -> anyhow::Result<Outputs> {
            Ok(vec![xs * 2.0])
        }
    }

    /// 第一次调用很慢
    struct SlowOnce {
        calls: Arc<AtomicU32>,
    }

    impl Model for SlowOnce {
        fn run(&mut self, xs: Array<f32, IxDyn>) -> anyhow::Result<Outputs> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                thread::sleep(Duration::from_millis(200));
            }
            Ok(vec![xs])
        }
    }

    struct Failing;

    impl Model for Failing {
        fn run(&mut self, _xs: Array<f32, IxDyn>) -> anyhow::Result<Outputs> {
            anyhow::bail!("shape mismatch")
        }
    }

    #[test]
    fn test_infer_returns_outputs() {
        let mut worker = InferenceWorker::spawn(Box::new(Doubler), Duration::from_secs(1)).unwrap();
        let ys = worker.infer(Array::ones(IxDyn(&[1, 2]))).unwrap();
        assert_eq!(ys[0][[0, 1]], 2.0);
        assert!(!worker.is_busy());
    }

    #[test]
    fn test_run_error_is_reported() {
        let mut worker = InferenceWorker::spawn(Box::new(Failing), Duration::from_secs(1)).unwrap();
        let err = worker.infer(Array::ones(IxDyn(&[1]))).unwrap_err();
        assert_eq!(err, InferenceError::Run("shape mismatch".into()));
    }

    #[test]
    fn test_timeout_then_busy_then_recovers() {
        let calls = Arc::new(AtomicU32::new(0));
        let model = SlowOnce {
            calls: calls.clone(),
        };
        let mut worker = InferenceWorker::spawn(Box::new(model), Duration::from_millis(30)).unwrap();

        let err = worker.infer(Array::ones(IxDyn(&[1]))).unwrap_err();
        assert!(matches!(err, InferenceError::Timeout(_)));
        assert_eq!(
            worker.infer(Array::ones(IxDyn(&[1]))).unwrap_err(),
            InferenceError::Busy
        );

        thread::sleep(Duration::from_millis(300));
        let ys = worker.infer(Array::zeros(IxDyn(&[1]))).unwrap();
        assert_eq!(ys[0][[0]], 0.0);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
