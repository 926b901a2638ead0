// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 标注 (Annotator)
//!
//! 在原图上绘制检测框、标签、关键点骨架与掩码, 并编码为输出图像。

use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use ab_glyph::{FontArc, PxScale};
use image::{ImageFormat, Rgb, RgbImage};
use imageproc::drawing::{
    draw_filled_circle_mut, draw_hollow_rect_mut, draw_line_segment_mut, draw_text_mut,
};
use imageproc::rect::Rect;
use rayon::prelude::*;
use tracing::{info, warn};

use crate::input::Frame;
use crate::{Detection, FrameError, SKELETON};

/// 掩码叠加透明度
const MASK_ALPHA: f32 = 0.4;

// 调色板
const BRIGHT_COLORS: [(u8, u8, u8); 12] = [
    (255, 0, 0),     // 红色
    (0, 255, 0),     // 绿色
    (0, 0, 255),     // 蓝色
    (255, 255, 0),   // 黄色
    (255, 0, 255),   // 品红
    (0, 255, 255),   // 青色
    (255, 128, 0),   // 橙色
    (255, 0, 128),   // 粉红
    (128, 255, 0),   // 黄绿
    (0, 128, 255),   // 天蓝
    (255, 255, 255), // 白色
    (128, 0, 255),   // 紫色
];

pub struct Annotator {
    enabled: bool,
    names: Vec<String>,
    font: Option<FontArc>,
    missing_font_logged: AtomicBool,
}

impl Annotator {
    pub fn new(enabled: bool, names: Vec<String>, font: Option<FontArc>) -> Self {
        Self {
            enabled,
            names,
            font,
            missing_font_logged: AtomicBool::new(false),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn color(&self, class_id: usize) -> Rgb<u8> {
        let (r, g, b) = BRIGHT_COLORS[class_id % BRIGHT_COLORS.len()];
        Rgb([r, g, b])
    }

    fn label(&self, det: &Detection) -> String {
        let name = self
            .names
            .get(det.class_id())
            .cloned()
            .unwrap_or_else(|| format!("class{}", det.class_id()));
        format!("{} {:.2}", name, det.confidence())
    }

    /// 绘制单帧; 未启用或无检测时原样返回
    pub fn annotate(&self, frame: &Frame, detections: &[Detection]) -> Result<RgbImage, FrameError> {
        let mut img = RgbImage::from_raw(frame.width, frame.height, frame.rgb_data.clone())
            .ok_or_else(|| {
                FrameError::Annotate(format!(
                    "buffer does not match {}x{}",
                    frame.width, frame.height
                ))
            })?;
        if !self.enabled || detections.is_empty() {
            return Ok(img);
        }

        // masks first, boxes on top
        for det in detections.iter() {
            if let Some(mask) = &det.mask {
                let color = self.color(det.class_id());
                for y in mask.y..(mask.y + mask.height).min(img.height()) {
                    for x in mask.x..(mask.x + mask.width).min(img.width()) {
                        if mask.get(x, y) {
                            let p = img.get_pixel_mut(x, y);
                            for c in 0..3 {
                                p.0[c] = (p.0[c] as f32 * (1. - MASK_ALPHA)
                                    + color.0[c] as f32 * MASK_ALPHA)
                                    as u8;
                            }
                        }
                    }
                }
            }
        }

        let legend_size = (img.width().max(img.height()) / 40).max(12);
        for det in detections.iter() {
            let color = self.color(det.class_id());
            let bbox = &det.bbox;
            let w = (bbox.width().round() as u32).max(1);
            let h = (bbox.height().round() as u32).max(1);
            draw_hollow_rect_mut(
                &mut img,
                Rect::at(bbox.xmin() as i32, bbox.ymin() as i32).of_size(w, h),
                color,
            );

            match &self.font {
                Some(font) => {
                    draw_text_mut(
                        &mut img,
                        color,
                        bbox.xmin() as i32,
                        (bbox.ymin() - legend_size as f32).max(0.) as i32,
                        PxScale::from(legend_size as f32 - 1.),
                        font,
                        &self.label(det),
                    );
                }
                None => {
                    if !self.missing_font_logged.swap(true, Ordering::Relaxed) {
                        warn!("no font available, drawing boxes without labels");
                    }
                }
            }

            if let Some(kpts) = &det.keypoints {
                for kpt in kpts.iter().filter(|k| k.is_visible()) {
                    draw_filled_circle_mut(&mut img, (kpt.x() as i32, kpt.y() as i32), 2, color);
                }
                if kpts.len() == 17 {
                    for &(a, b) in SKELETON.iter() {
                        let (ka, kb) = (&kpts[a], &kpts[b]);
                        if ka.is_visible() && kb.is_visible() {
                            draw_line_segment_mut(
                                &mut img,
                                (ka.x(), ka.y()),
                                (kb.x(), kb.y()),
                                color,
                            );
                        }
                    }
                }
            }
        }

        Ok(img)
    }

    pub fn annotate_batch(
        &self,
        items: &[(&Frame, &[Detection])],
    ) -> Vec<Result<RgbImage, FrameError>> {
        items
            .par_iter()
            .map(|(frame, dets)| self.annotate(frame, dets))
            .collect()
    }
}

/// 编码输出图像
pub fn encode_image(img: &RgbImage, format: ImageFormat) -> Result<Vec<u8>, FrameError> {
    let mut bytes = Cursor::new(Vec::new());
    img.write_to(&mut bytes, format)
        .map_err(|e| FrameError::Encode(e.to_string()))?;
    Ok(bytes.into_inner())
}

/// 加载标签字体: 配置路径 > Ultralytics 配置目录下的 Arial.ttf
pub fn load_font(configured: Option<&Path>) -> Option<FontArc> {
    let mut candidates: Vec<PathBuf> = Vec::new();
    if let Some(p) = configured {
        candidates.push(p.to_path_buf());
    }
    if let Some(dir) = dirs::config_dir() {
        candidates.push(dir.join("Ultralytics").join("Arial.ttf"));
    }
    for path in candidates.iter() {
        match std::fs::read(path) {
            Ok(bytes) => match FontArc::try_from_vec(bytes) {
                Ok(font) => {
                    info!(font = %path.display(), "label font loaded");
                    return Some(font);
                }
                Err(e) => warn!(font = %path.display(), "invalid font file: {e}"),
            },
            Err(_) => continue,
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::RawFrame;
    use crate::{Bbox, Mask};

    fn gray_frame() -> Frame {
        Frame::from_raw(0, 1, RawFrame::new(32, 32, vec![100; 32 * 32 * 3]))
    }

    #[test]
    fn test_no_detections_is_pass_through() {
        let frame = gray_frame();
        let annotator = Annotator::new(true, vec!["debris".into()], None);
        let img = annotator.annotate(&frame, &[]).unwrap();
        assert_eq!(img.into_raw(), frame.rgb_data);
    }

    #[test]
    fn test_disabled_is_pass_through() {
        let frame = gray_frame();
        let annotator = Annotator::new(false, vec![], None);
        let det = Detection::new(Bbox::new(4., 4., 10., 10., 0, 0.9));
        let img = annotator.annotate(&frame, &[det]).unwrap();
        assert_eq!(img.into_raw(), frame.rgb_data);
    }

    #[test]
    fn test_box_is_drawn_in_class_color() {
        let frame = gray_frame();
        let annotator = Annotator::new(true, vec![], None);
        let det = Detection::new(Bbox::new(4., 4., 10., 10., 1, 0.9));
        let img = annotator.annotate(&frame, &[det]).unwrap();
        assert_eq!(*img.get_pixel(4, 4), annotator.color(1));
        assert_eq!(*img.get_pixel(20, 20), Rgb([100, 100, 100]));
    }

    #[test]
    fn test_mask_is_blended() {
        let frame = gray_frame();
        let annotator = Annotator::new(true, vec![], None);
        let mut det = Detection::new(Bbox::new(4., 4., 10., 10., 0, 0.9));
        det.mask = Some(Mask {
            x: 8,
            y: 8,
            width: 1,
            height: 1,
            data: vec![255],
        });
        let img = annotator.annotate(&frame, &[det]).unwrap();
        assert_ne!(*img.get_pixel(8, 8), Rgb([100, 100, 100]));
        assert_eq!(*img.get_pixel(9, 9), Rgb([100, 100, 100]));
    }

    #[test]
    fn test_encode_bmp_header() {
        let img = RgbImage::new(2, 2);
        let bytes = encode_image(&img, ImageFormat::Bmp).unwrap();
        assert_eq!(&bytes[..2], b"BM");
    }
}
