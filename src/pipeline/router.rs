// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 输出路由 (Output Router)
//!
//! 按本轮路由快照把每个摄像头的结果分发到窗口。
//! 每个摄像头的图像只编码一次, 多个窗口共享同一份结果。

use std::collections::BTreeMap;

use image::RgbImage;
use rayon::prelude::*;
use tracing::warn;

use crate::config::EncodeFormat;
use crate::control::{EventSink, ShellEvent};
use crate::detection::encode_image;
use crate::input::Frame;
use crate::pipeline::RoutingTable;
use crate::{Detection, SourceId};

/// 一帧的处理结果, 由路由器消费一次
#[derive(Debug)]
pub struct FrameResult {
    pub frame: Frame,
    pub detections: Vec<Detection>,
    pub image: RgbImage,
}

/// 本轮每个摄像头的结果
#[derive(Debug)]
pub enum SourceOutcome {
    Ready(FrameResult),
    /// 摄像头打开/读取失败
    Failed(String),
    /// 没有可用帧 ("waiting")
    NoData,
}

/// 编码后的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodedOutcome {
    Image { seq: u64, bytes: Vec<u8> },
    Failed(String),
    NoData,
}

/// 本轮各类事件数量
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RouteReport {
    pub images: usize,
    pub errors: usize,
    pub no_data: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct OutputRouter {
    format: EncodeFormat,
}

impl OutputRouter {
    pub fn new(format: EncodeFormat) -> Self {
        Self { format }
    }

    /// 编码每个摄像头的结果 (并行, 每个摄像头一次)
    pub fn encode(
        &self,
        outcomes: BTreeMap<SourceId, SourceOutcome>,
    ) -> BTreeMap<SourceId, EncodedOutcome> {
        let image_format = self.format.image_format();
        outcomes
            .into_par_iter()
            .map(|(id, outcome)| {
                let encoded = match outcome {
                    SourceOutcome::Ready(result) => match encode_image(&result.image, image_format) {
                        Ok(bytes) => EncodedOutcome::Image {
                            seq: result.frame.seq,
                            bytes,
                        },
                        Err(e) => {
                            warn!(camera = id, "{}", e);
                            EncodedOutcome::NoData
                        }
                    },
                    SourceOutcome::Failed(reason) => EncodedOutcome::Failed(reason),
                    SourceOutcome::NoData => EncodedOutcome::NoData,
                };
                (id, encoded)
            })
            .collect()
    }

    /// 按路由快照向每个已映射窗口发送一个事件; 未映射的窗口不发送
    pub fn emit(
        &self,
        snapshot: &RoutingTable,
        encoded: &BTreeMap<SourceId, EncodedOutcome>,
        sink: &mut dyn EventSink,
    ) -> RouteReport {
        let mut report = RouteReport::default();
        for (destination, source) in snapshot.mapped() {
            let event = match encoded.get(&source) {
                Some(EncodedOutcome::Image { seq, bytes }) => {
                    report.images += 1;
                    ShellEvent::Image {
                        destination,
                        source,
                        seq: *seq,
                        format: self.format.as_str().to_string(),
                        bytes: bytes.clone(),
                    }
                }
                Some(EncodedOutcome::Failed(reason)) => {
                    report.errors += 1;
                    ShellEvent::Error {
                        destination,
                        reason: reason.clone(),
                    }
                }
                Some(EncodedOutcome::NoData) | None => {
                    report.no_data += 1;
                    ShellEvent::NoData { destination }
                }
            };
            sink.emit(event);
        }
        report
    }

    pub fn route(
        &self,
        snapshot: &RoutingTable,
        outcomes: BTreeMap<SourceId, SourceOutcome>,
        sink: &mut dyn EventSink,
    ) -> RouteReport {
        let encoded = self.encode(outcomes);
        self.emit(snapshot, &encoded, sink)
    }

    /// 整批失败: 每个已映射窗口收到同一错误
    pub fn route_batch_failure(
        &self,
        snapshot: &RoutingTable,
        reason: &str,
        sink: &mut dyn EventSink,
    ) -> RouteReport {
        let mut report = RouteReport::default();
        for (destination, _) in snapshot.mapped() {
            report.errors += 1;
            sink.emit(ShellEvent::Error {
                destination,
                reason: reason.to_string(),
            });
        }
        report
    }

    /// 退出前: 每个已映射窗口收到最后一次 NoData
    pub fn drain(&self, snapshot: &RoutingTable, sink: &mut dyn EventSink) -> RouteReport {
        let mut report = RouteReport::default();
        for (destination, _) in snapshot.mapped() {
            report.no_data += 1;
            sink.emit(ShellEvent::NoData { destination });
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::RawFrame;

    fn ready(source: SourceId, seq: u64) -> SourceOutcome {
        let frame = Frame::from_raw(source, seq, RawFrame::new(2, 2, vec![7; 12]));
        SourceOutcome::Ready(FrameResult {
            image: RgbImage::from_raw(2, 2, frame.rgb_data.clone()).unwrap(),
            frame,
            detections: vec![],
        })
    }

    fn table(pairs: &[(usize, Option<SourceId>)]) -> RoutingTable {
        let mut t = RoutingTable::new(4);
        for &(d, s) in pairs {
            t.set(d, s).unwrap();
        }
        t
    }

    #[test]
    fn test_shared_source_reaches_every_destination() {
        let router = OutputRouter::new(EncodeFormat::Bmp);
        let snapshot = table(&[(0, Some(1)), (2, Some(1))]);
        let mut sink: Vec<ShellEvent> = Vec::new();
        let report = router.route(&snapshot, BTreeMap::from([(1, ready(1, 9))]), &mut sink);
        assert_eq!(report.images, 2);
        assert_eq!(sink.len(), 2);
        assert!(matches!(
            &sink[1],
            ShellEvent::Image { destination: 2, source: 1, seq: 9, format, .. } if format == "bmp"
        ));
    }

    #[test]
    fn test_unmapped_destination_stays_idle() {
        let router = OutputRouter::new(EncodeFormat::Png);
        let snapshot = table(&[(1, Some(0))]);
        let mut sink: Vec<ShellEvent> = Vec::new();
        router.route(
            &snapshot,
            BTreeMap::from([(0, SourceOutcome::Failed("unplugged".into()))]),
            &mut sink,
        );
        assert_eq!(
            sink,
            vec![ShellEvent::Error {
                destination: 1,
                reason: "unplugged".into()
            }]
        );
    }

    #[test]
    fn test_missing_outcome_is_no_data() {
        let router = OutputRouter::new(EncodeFormat::Bmp);
        let snapshot = table(&[(3, Some(5))]);
        let mut sink: Vec<ShellEvent> = Vec::new();
        router.route(&snapshot, BTreeMap::new(), &mut sink);
        assert_eq!(sink, vec![ShellEvent::NoData { destination: 3 }]);
    }

    #[test]
    fn test_batch_failure_hits_all_mapped() {
        let router = OutputRouter::new(EncodeFormat::Bmp);
        let snapshot = table(&[(0, Some(0)), (1, Some(1)), (2, None)]);
        let mut sink: Vec<ShellEvent> = Vec::new();
        let report = router.route_batch_failure(&snapshot, "inference timed out", &mut sink);
        assert_eq!(report.errors, 2);
        assert!(sink.iter().all(|e| matches!(e, ShellEvent::Error { .. })));
    }
}
