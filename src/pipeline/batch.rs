// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 批次组装 (Batch Assembler)
//!
//! 少于 batch_min 时直接以较小批次继续, 从不等待;
//! 多于 batch_max 时截断, 被推迟的摄像头在下一轮优先读取。

use std::collections::BTreeSet;

use tracing::debug;

use crate::input::Frame;
use crate::SourceId;

/// 一轮推理的输入帧
#[derive(Debug, Default)]
pub struct FrameBatch {
    pub frames: Vec<Frame>,
    /// 因超出 batch_max 而推迟到下一轮的摄像头
    pub deferred: Vec<SourceId>,
}

impl FrameBatch {
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct BatchAssembler {
    batch_min: usize,
    batch_max: usize,
    carry_over: Vec<SourceId>,
}

impl BatchAssembler {
    pub fn new(batch_min: usize, batch_max: usize) -> Self {
        Self {
            batch_min: batch_min.max(1),
            batch_max: batch_max.max(1),
            carry_over: Vec::new(),
        }
    }

    pub fn batch_max(&self) -> usize {
        self.batch_max
    }

    /// 本轮读取顺序: 上一轮推迟的摄像头优先, 其余按编号升序
    ///
    /// 这里有意不按纯编号顺序: 摄像头多于 batch_max 时,
    /// 编号大的摄像头否则每轮都会被推迟, 永远得不到推理。
    pub fn poll_order(&self, referenced: &BTreeSet<SourceId>) -> Vec<SourceId> {
        let mut order: Vec<SourceId> = self
            .carry_over
            .iter()
            .filter(|id| referenced.contains(id))
            .copied()
            .collect();
        let rest: Vec<SourceId> = referenced
            .iter()
            .filter(|id| !order.contains(id))
            .copied()
            .collect();
        order.extend(rest);
        order
    }

    /// `frames` 按读取顺序给出
    pub fn assemble(&mut self, mut frames: Vec<Frame>) -> FrameBatch {
        let deferred: Vec<SourceId> = if frames.len() > self.batch_max {
            frames
                .split_off(self.batch_max)
                .into_iter()
                .map(|f| f.source)
                .collect()
        } else {
            Vec::new()
        };
        if !frames.is_empty() && frames.len() < self.batch_min {
            debug!(
                "batch of {} is below batch_min {}, proceeding",
                frames.len(),
                self.batch_min
            );
        }
        self.carry_over = deferred.clone();
        FrameBatch { frames, deferred }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::RawFrame;

    fn frames(ids: &[SourceId]) -> Vec<Frame> {
        ids.iter()
            .map(|&id| Frame::from_raw(id, 1, RawFrame::new(1, 1, vec![0; 3])))
            .collect()
    }

    #[test]
    fn test_below_min_proceeds() {
        let mut asm = BatchAssembler::new(3, 3);
        let batch = asm.assemble(frames(&[2]));
        assert_eq!(batch.len(), 1);
        assert!(batch.deferred.is_empty());
    }

    #[test]
    fn test_above_max_defers_and_prioritises_next_time() {
        let mut asm = BatchAssembler::new(1, 2);
        let referenced = BTreeSet::from([0, 1, 2, 3]);
        let order = asm.poll_order(&referenced);
        assert_eq!(order, vec![0, 1, 2, 3]);

        let batch = asm.assemble(frames(&order));
        assert_eq!(
            batch.frames.iter().map(|f| f.source).collect::<Vec<_>>(),
            vec![0, 1]
        );
        assert_eq!(batch.deferred, vec![2, 3]);
        assert_eq!(asm.poll_order(&referenced), vec![2, 3, 0, 1]);
    }

    #[test]
    fn test_carry_over_ignores_unreferenced() {
        let mut asm = BatchAssembler::new(1, 1);
        asm.assemble(frames(&[0, 5]));
        assert_eq!(asm.poll_order(&BTreeSet::from([0, 1])), vec![0, 1]);
    }

    #[test]
    fn test_empty_batch() {
        let mut asm = BatchAssembler::new(1, 3);
        assert!(asm.assemble(Vec::new()).is_empty());
    }
}
