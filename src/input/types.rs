// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
/// 摄像头输入数据结构
/// Data structures for camera acquisition
use chrono::{DateTime, Utc};

use crate::SourceId;

/// 设备读出的原始 RGB8 帧 (尚未编号)
#[derive(Clone, Debug)]
pub struct RawFrame {
    pub width: u32,
    pub height: u32,
    pub rgb_data: Vec<u8>,
    pub captured_at: DateTime<Utc>,
}

impl RawFrame {
    pub fn new(width: u32, height: u32, rgb_data: Vec<u8>) -> Self {
        Self {
            width,
            height,
            rgb_data,
            captured_at: Utc::now(),
        }
    }
}

/// 流水线持有的帧: 从采集到发送, 不跨轮次保留
#[derive(Clone, Debug)]
pub struct Frame {
    pub source: SourceId,
    pub seq: u64, // 每路摄像头单调递增
    pub captured_at: DateTime<Utc>,
    pub width: u32,
    pub height: u32,
    pub rgb_data: Vec<u8>, // RGB8, 行优先
}

impl Frame {
    pub fn from_raw(source: SourceId, seq: u64, raw: RawFrame) -> Self {
        Self {
            source,
            seq,
            captured_at: raw.captured_at,
            width: raw.width,
            height: raw.height,
            rgb_data: raw.rgb_data,
        }
    }

    /// 像素缓冲区与宽高是否一致
    pub fn is_well_formed(&self) -> bool {
        self.width > 0
            && self.height > 0
            && self.rgb_data.len() == self.width as usize * self.height as usize * 3
    }
}

/// 摄像头状态
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SourceStatus {
    Open,
    Closed,
    Errored(String),
}

/// 单次读取结果
#[derive(Clone, Debug)]
pub enum ReadOutcome {
    Frame(Frame),
    NotReady,
    Errored(String),
}
