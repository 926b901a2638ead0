// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 预处理 (Preprocessor)
//!
//! 等比缩放 + 灰边填充 (letterbox) 到模型输入尺寸, 归一化为 CHW f32。
//! 每帧独立、无状态, 可在线程池中并行执行。

use fast_image_resize as fr;
use ndarray::{s, Array, Array3, Axis, IxDyn};
use rayon::prelude::*;

use crate::input::Frame;
use crate::FrameError;

/// 填充像素值
pub const FILL_VALUE: u8 = 144;

/// 等比缩放参数, 用于模型坐标 ↔ 原图坐标互转
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Letterbox {
    pub scale: f32,
    pub pad_x: f32,
    pub pad_y: f32,
    pub src_width: u32,
    pub src_height: u32,
    pub new_width: u32,
    pub new_height: u32,
    pub dst_width: u32,
    pub dst_height: u32,
}

impl Letterbox {
    pub fn new(src_width: u32, src_height: u32, dst_width: u32, dst_height: u32) -> Self {
        let (w0, h0) = (src_width as f32, src_height as f32);
        let r = (dst_width as f32 / w0).min(dst_height as f32 / h0);
        let new_width = ((w0 * r).round() as u32).clamp(1, dst_width);
        let new_height = ((h0 * r).round() as u32).clamp(1, dst_height);
        // 灰边平分到两侧
        let pad_x = ((dst_width - new_width) / 2) as f32;
        let pad_y = ((dst_height - new_height) / 2) as f32;
        Self {
            scale: r,
            pad_x,
            pad_y,
            src_width,
            src_height,
            new_width,
            new_height,
            dst_width,
            dst_height,
        }
    }

    /// 原图坐标 → 模型坐标
    pub fn forward(&self, x: f32, y: f32) -> (f32, f32) {
        (x * self.scale + self.pad_x, y * self.scale + self.pad_y)
    }

    /// 模型坐标 → 原图坐标
    pub fn inverse(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }

    /// 模型坐标 → 原图坐标, 并裁剪到原图范围内
    pub fn inverse_clamped(&self, x: f32, y: f32) -> (f32, f32) {
        let (x, y) = self.inverse(x, y);
        (
            x.clamp(0., self.src_width as f32),
            y.clamp(0., self.src_height as f32),
        )
    }
}

/// 单帧预处理结果
#[derive(Debug, Clone)]
pub struct PreparedFrame {
    pub tensor: Array3<f32>, // 3 x H x W
    pub letterbox: Letterbox,
}

#[derive(Debug, Clone, Copy)]
pub struct Preprocessor {
    width: u32,
    height: u32,
}

impl Preprocessor {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn prepare(&self, frame: &Frame) -> Result<PreparedFrame, FrameError> {
        if !frame.is_well_formed() {
            return Err(FrameError::Malformed {
                id: frame.source,
                reason: format!(
                    "{}x{} frame with {} bytes",
                    frame.width,
                    frame.height,
                    frame.rgb_data.len()
                ),
            });
        }

        let letterbox = Letterbox::new(frame.width, frame.height, self.width, self.height);
        let malformed = |reason: String| FrameError::Malformed {
            id: frame.source,
            reason,
        };

        // Resize: 原始分辨率 → 等比缩放后的尺寸 (fast_image_resize, 双线性)
        let resized: Vec<u8>;
        let pixels: &[u8] = if letterbox.new_width == frame.width
            && letterbox.new_height == frame.height
        {
            &frame.rgb_data
        } else {
            let src = fr::images::ImageRef::new(
                frame.width,
                frame.height,
                &frame.rgb_data,
                fr::PixelType::U8x3,
            )
            .map_err(|e| malformed(e.to_string()))?;
            let mut dst =
                fr::images::Image::new(letterbox.new_width, letterbox.new_height, fr::PixelType::U8x3);
            let mut resizer = fr::Resizer::new();
            resizer
                .resize(
                    &src,
                    &mut dst,
                    &fr::ResizeOptions::new()
                        .resize_alg(fr::ResizeAlg::Convolution(fr::FilterType::Bilinear)),
                )
                .map_err(|e| malformed(e.to_string()))?;
            resized = dst.into_vec();
            &resized
        };

        // HWC u8 → CHW f32, 贴到灰色画布中央
        let mut tensor = Array3::from_elem(
            (3, self.height as usize, self.width as usize),
            FILL_VALUE as f32 / 255.0,
        );
        let (nw, nh) = (letterbox.new_width as usize, letterbox.new_height as usize);
        let (px, py) = (letterbox.pad_x as usize, letterbox.pad_y as usize);
        let hwc = ndarray::ArrayView3::from_shape((nh, nw, 3), pixels)
            .map_err(|e| malformed(e.to_string()))?;
        tensor
            .slice_mut(s![.., py..py + nh, px..px + nw])
            .assign(&hwc.permuted_axes([2, 0, 1]).mapv(|v| v as f32 / 255.0));

        Ok(PreparedFrame { tensor, letterbox })
    }

    /// 并行预处理整个批次, 结果顺序与输入一致
    pub fn prepare_batch(&self, frames: &[Frame]) -> Vec<Result<PreparedFrame, FrameError>> {
        frames.par_iter().map(|f| self.prepare(f)).collect()
    }
}

/// 将多帧张量堆叠为 N x 3 x H x W; 固定批大小的模型用全零补齐到 `slots`
pub fn stack_batch(
    prepared: &[&PreparedFrame],
    width: u32,
    height: u32,
    slots: Option<usize>,
) -> Array<f32, IxDyn> {
    let n = slots.unwrap_or(0).max(prepared.len());
    let mut ys = Array::zeros((n, 3, height as usize, width as usize));
    for (mut slot, p) in ys.axis_iter_mut(Axis(0)).zip(prepared.iter()) {
        slot.assign(&p.tensor);
    }
    ys.into_dyn()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::RawFrame;

    fn frame(width: u32, height: u32, value: u8) -> Frame {
        Frame::from_raw(
            0,
            0,
            RawFrame::new(width, height, vec![value; (width * height * 3) as usize]),
        )
    }

    #[test]
    fn test_letterbox_wide_frame() {
        let lb = Letterbox::new(640, 480, 512, 512);
        assert!((lb.scale - 0.8).abs() < 1e-6);
        assert_eq!((lb.new_width, lb.new_height), (512, 384));
        assert_eq!((lb.pad_x, lb.pad_y), (0.0, 64.0));
    }

    #[test]
    fn test_letterbox_round_trip() {
        let lb = Letterbox::new(1280, 720, 640, 640);
        let (mx, my) = lb.forward(300.0, 200.0);
        let (x, y) = lb.inverse(mx, my);
        assert!((x - 300.0).abs() < 1e-3);
        assert!((y - 200.0).abs() < 1e-3);
    }

    #[test]
    fn test_prepare_fills_padding() {
        let pre = Preprocessor::new(8, 8);
        let p = pre.prepare(&frame(8, 4, 255)).unwrap();
        assert_eq!(p.tensor.dim(), (3, 8, 8));
        let fill = FILL_VALUE as f32 / 255.0;
        // 上下各 2 行灰边
        assert!((p.tensor[[0, 0, 0]] - fill).abs() < 1e-6);
        assert!((p.tensor[[2, 7, 7]] - fill).abs() < 1e-6);
        assert!((p.tensor[[1, 4, 4]] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_prepare_rejects_short_buffer() {
        let pre = Preprocessor::new(8, 8);
        let mut f = frame(4, 4, 0);
        f.rgb_data.truncate(10);
        assert!(matches!(pre.prepare(&f), Err(FrameError::Malformed { .. })));
    }

    #[test]
    fn test_stack_batch_shape() {
        let pre = Preprocessor::new(16, 16);
        let a = pre.prepare(&frame(32, 16, 10)).unwrap();
        let b = pre.prepare(&frame(16, 32, 20)).unwrap();
        let xs = stack_batch(&[&a, &b], 16, 16, None);
        assert_eq!(xs.shape(), &[2, 3, 16, 16]);
        let xs = stack_batch(&[&a], 16, 16, Some(3));
        assert_eq!(xs.shape(), &[3, 3, 16, 16]);
        assert_eq!(xs[[2, 0, 8, 8]], 0.0);
    }
}
