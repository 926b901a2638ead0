// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
use std::fmt;
use std::time::{Duration, Instant};

/// 每轮各阶段耗时
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StageTimings {
    pub acquire: Duration,
    pub assemble: Duration,
    pub preprocess: Duration,
    pub infer: Duration,
    pub postprocess: Duration,
    pub annotate: Duration,
    pub route: Duration,
}

impl StageTimings {
    pub fn total(&self) -> Duration {
        self.acquire
            + self.assemble
            + self.preprocess
            + self.infer
            + self.postprocess
            + self.annotate
            + self.route
    }
}

impl fmt::Display for StageTimings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "acquire {:?} | assemble {:?} | preprocess {:?} | infer {:?} | postprocess {:?} | annotate {:?} | route {:?} | total {:?}",
            self.acquire,
            self.assemble,
            self.preprocess,
            self.infer,
            self.postprocess,
            self.annotate,
            self.route,
            self.total()
        )
    }
}

/// 计时器: 每次 `lap` 返回距上次的耗时
pub(crate) struct Stopwatch(Instant);

impl Stopwatch {
    pub(crate) fn start() -> Self {
        Self(Instant::now())
    }

    pub(crate) fn lap(&mut self) -> Duration {
        let now = Instant::now();
        let elapsed = now - self.0;
        self.0 = now;
        elapsed
    }
}
