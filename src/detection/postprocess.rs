// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 后处理 (Postprocessor)
//!
//! 模型输出 `[N, 4 + nc + extra, anchors]` → 每帧检测结果:
//! 置信度过滤 → 按类别 NMS → 关键点 / 掩码解码 → 映射回原图坐标。

use ndarray::{s, Array, ArrayView2, ArrayView3, Axis, Ix3, Ix4, IxDyn};
use rayon::prelude::*;

use crate::detection::Letterbox;
use crate::{non_max_suppression, Bbox, Detection, FrameError, Mask, Point2};

const CXYWH_OFFSET: usize = 4;
const KPT_STEP: usize = 3;

/// 任务头: 共享 box/class 解码, 附加部分不同
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskHead {
    Detect,
    Pose { nk: usize },
    Segment { nm: usize },
}

impl TaskHead {
    /// box/class 之后的附加通道数
    pub fn extra_channels(&self) -> usize {
        match *self {
            TaskHead::Detect => 0,
            TaskHead::Pose { nk } => KPT_STEP * nk,
            TaskHead::Segment { nm } => nm,
        }
    }
}

/// NMS 前的候选附加信息: (关键点, 掩码系数)
type Extras = (Option<Vec<Point2>>, Option<Vec<f32>>);

#[derive(Debug, Clone)]
pub struct Postprocessor {
    head: TaskHead,
    nc: usize,
    conf: f32,
    iou: f32,
    kconf: f32,
}

impl Postprocessor {
    pub fn new(head: TaskHead, nc: usize, conf: f32, iou: f32, kconf: f32) -> Self {
        Self {
            head,
            nc,
            conf,
            iou,
            kconf,
        }
    }

    pub fn head(&self) -> TaskHead {
        self.head
    }

    pub fn nc(&self) -> usize {
        self.nc
    }

    /// 期望的每个 anchor 通道数
    pub fn channels(&self) -> usize {
        CXYWH_OFFSET + self.nc + self.head.extra_channels()
    }

    /// 解码单帧: `preds` 为 C x A, `protos` 为 nm x ph x pw (仅分割)
    pub fn decode(
        &self,
        preds: ArrayView2<f32>,
        protos: Option<ArrayView3<f32>>,
        letterbox: &Letterbox,
    ) -> Result<Vec<Detection>, FrameError> {
        let channels = preds.nrows();
        if channels != self.channels() {
            return Err(FrameError::Decode(format!(
                "expected {} channels per anchor, got {}",
                self.channels(),
                channels
            )));
        }
        let protos = match (self.head, protos) {
            (TaskHead::Segment { nm }, Some(p)) if p.dim().0 == nm => Some(p),
            (TaskHead::Segment { nm }, Some(p)) => {
                return Err(FrameError::Decode(format!(
                    "expected {} mask prototypes, got {}",
                    nm,
                    p.dim().0
                )))
            }
            (TaskHead::Segment { .. }, None) => {
                return Err(FrameError::Decode("missing mask prototypes".into()))
            }
            _ => None,
        };

        let (w0, h0) = (letterbox.src_width as f32, letterbox.src_height as f32);
        let mut data: Vec<(Bbox, Extras)> = Vec::new();
        for pred in preds.axis_iter(Axis(1)) {
            let clss = pred.slice(s![CXYWH_OFFSET..CXYWH_OFFSET + self.nc]);
            let Some((id, confidence)) = clss
                .iter()
                .copied()
                .enumerate()
                .reduce(|max, x| if x.1 > max.1 { x } else { max })
            else {
                continue;
            };

            // NaN 不满足 >=, 一并丢弃
            if !(confidence >= self.conf) {
                continue;
            }

            let (cx, cy, w, h) = (pred[0], pred[1], pred[2], pred[3]);
            let (x1, y1) = letterbox.inverse_clamped(cx - w / 2., cy - h / 2.);
            let (x2, y2) = letterbox.inverse_clamped(cx + w / 2., cy + h / 2.);
            if !(x2 > x1 && y2 > y1) {
                continue;
            }
            let bbox = Bbox::from_xyxy(x1, y1, x2, y2, id, confidence);

            let kpts = match self.head {
                TaskHead::Pose { nk } => {
                    let kpts = pred.slice(s![channels - KPT_STEP * nk..]);
                    let mut kpts_ = Vec::with_capacity(nk);
                    for i in 0..nk {
                        let (kx, ky) =
                            letterbox.inverse(kpts[KPT_STEP * i], kpts[KPT_STEP * i + 1]);
                        let (kx, ky) = (kx.clamp(0., w0), ky.clamp(0., h0));
                        let kconf = kpts[KPT_STEP * i + 2];
                        if kconf >= self.kconf {
                            kpts_.push(Point2::new_with_conf(kx, ky, kconf));
                        } else {
                            kpts_.push(Point2::hidden(kx, ky, kconf));
                        }
                    }
                    Some(kpts_)
                }
                _ => None,
            };
            let coefs = match self.head {
                TaskHead::Segment { nm } => Some(pred.slice(s![channels - nm..]).to_vec()),
                _ => None,
            };

            data.push((bbox, (kpts, coefs)));
        }

        non_max_suppression(&mut data, self.iou);

        let mut ys = Vec::with_capacity(data.len());
        for (bbox, (keypoints, coefs)) in data.into_iter() {
            let mask = match (coefs, protos.as_ref()) {
                (Some(coefs), Some(protos)) => Some(decode_mask(&coefs, protos, &bbox, letterbox)?),
                _ => None,
            };
            ys.push(Detection {
                bbox,
                keypoints,
                mask,
            });
        }
        Ok(ys)
    }

    /// 并行解码整个批次, 结果顺序与 letterboxes 一致
    pub fn decode_batch(
        &self,
        outputs: &[Array<f32, IxDyn>],
        letterboxes: &[Letterbox],
    ) -> Vec<Result<Vec<Detection>, FrameError>> {
        match self.batch_views(outputs, letterboxes.len()) {
            Ok((preds, protos)) => letterboxes
                .par_iter()
                .enumerate()
                .map(|(i, lb)| {
                    self.decode(
                        preds.index_axis(Axis(0), i),
                        protos.as_ref().map(|p| p.index_axis(Axis(0), i)),
                        lb,
                    )
                })
                .collect(),
            Err(e) => letterboxes.iter().map(|_| Err(e.clone())).collect(),
        }
    }

    /// 与 `decode_batch` 相同, 但顺序执行
    pub fn decode_batch_sequential(
        &self,
        outputs: &[Array<f32, IxDyn>],
        letterboxes: &[Letterbox],
    ) -> Vec<Result<Vec<Detection>, FrameError>> {
        match self.batch_views(outputs, letterboxes.len()) {
            Ok((preds, protos)) => letterboxes
                .iter()
                .enumerate()
                .map(|(i, lb)| {
                    self.decode(
                        preds.index_axis(Axis(0), i),
                        protos.as_ref().map(|p| p.index_axis(Axis(0), i)),
                        lb,
                    )
                })
                .collect(),
            Err(e) => letterboxes.iter().map(|_| Err(e.clone())).collect(),
        }
    }

    fn batch_views<'a>(
        &self,
        outputs: &'a [Array<f32, IxDyn>],
        n: usize,
    ) -> Result<
        (
            ndarray::ArrayView3<'a, f32>,
            Option<ndarray::ArrayView4<'a, f32>>,
        ),
        FrameError,
    > {
        let preds = outputs
            .first()
            .ok_or_else(|| FrameError::Decode("model produced no outputs".into()))?
            .view()
            .into_dimensionality::<Ix3>()
            .map_err(|e| FrameError::Decode(format!("predictions: {e}")))?;
        if preds.dim().0 < n {
            return Err(FrameError::Decode(format!(
                "model returned {} results for {} frames",
                preds.dim().0,
                n
            )));
        }
        let protos = match self.head {
            TaskHead::Segment { .. } => {
                let protos = outputs
                    .get(1)
                    .ok_or_else(|| FrameError::Decode("missing mask prototypes".into()))?
                    .view()
                    .into_dimensionality::<Ix4>()
                    .map_err(|e| FrameError::Decode(format!("prototypes: {e}")))?;
                if protos.dim().0 < n {
                    return Err(FrameError::Decode(format!(
                        "model returned {} prototype sets for {} frames",
                        protos.dim().0,
                        n
                    )));
                }
                Some(protos)
            }
            _ => None,
        };
        Ok((preds, protos))
    }
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// 掩码系数 · 原型 → sigmoid → 在检测框内逐像素采样, 0.5 二值化
fn decode_mask(
    coefs: &[f32],
    protos: &ArrayView3<f32>,
    bbox: &Bbox,
    letterbox: &Letterbox,
) -> Result<Mask, FrameError> {
    let (nm, ph, pw) = protos.dim();
    let coefs = Array::from_shape_vec((1, nm), coefs.to_vec())
        .map_err(|e| FrameError::Decode(e.to_string()))?;
    let protos = protos
        .to_shape((nm, ph * pw))
        .map_err(|e| FrameError::Decode(e.to_string()))?;
    let plane = coefs.dot(&protos);

    let x0 = bbox.xmin().floor().max(0.) as u32;
    let y0 = bbox.ymin().floor().max(0.) as u32;
    let x1 = (bbox.xmax().ceil() as u32).min(letterbox.src_width);
    let y1 = (bbox.ymax().ceil() as u32).min(letterbox.src_height);
    let (width, height) = (x1.saturating_sub(x0), y1.saturating_sub(y0));

    // 模型坐标 → 原型坐标
    let sx = pw as f32 / letterbox.dst_width as f32;
    let sy = ph as f32 / letterbox.dst_height as f32;

    let mut data = Vec::with_capacity((width * height) as usize);
    for y in y0..y1 {
        for x in x0..x1 {
            let (mx, my) = letterbox.forward(x as f32 + 0.5, y as f32 + 0.5);
            let px = ((mx * sx) as usize).min(pw.saturating_sub(1));
            let py = ((my * sy) as usize).min(ph.saturating_sub(1));
            let v = sigmoid(plane[[0, py * pw + px]]);
            data.push(if v > 0.5 { 255 } else { 0 });
        }
    }

    Ok(Mask {
        x: x0,
        y: y0,
        width,
        height,
        data,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    /// 单帧输出, 每列一个 anchor: [cx, cy, w, h, scores...]
    fn preds(nc: usize, anchors: &[(f32, f32, f32, f32, usize, f32)]) -> Array2<f32> {
        let mut xs = Array2::zeros((4 + nc, anchors.len()));
        for (a, &(cx, cy, w, h, cls, score)) in anchors.iter().enumerate() {
            xs[[0, a]] = cx;
            xs[[1, a]] = cy;
            xs[[2, a]] = w;
            xs[[3, a]] = h;
            xs[[4 + cls, a]] = score;
        }
        xs
    }

    #[test]
    fn test_decode_filters_by_confidence_and_maps_back() {
        let post = Postprocessor::new(TaskHead::Detect, 5, 0.5, 0.5, 0.5);
        // 1024x1024 原图 → 512x512, scale 0.5
        let lb = Letterbox::new(1024, 1024, 512, 512);
        let xs = preds(
            5,
            &[(100., 100., 20., 20., 2, 0.9), (300., 300., 20., 20., 1, 0.3)],
        );
        let ys = post.decode(xs.view(), None, &lb).unwrap();
        assert_eq!(ys.len(), 1);
        assert_eq!(ys[0].class_id(), 2);
        assert!((ys[0].bbox.xmin() - 180.).abs() < 1e-3);
        assert!((ys[0].bbox.width() - 40.).abs() < 1e-3);
    }

    #[test]
    fn test_decode_drops_nan_scores() {
        let post = Postprocessor::new(TaskHead::Detect, 1, 0.5, 0.5, 0.5);
        let lb = Letterbox::new(64, 64, 64, 64);
        let xs = preds(1, &[(10., 10., 4., 4., 0, f32::NAN)]);
        assert!(post.decode(xs.view(), None, &lb).unwrap().is_empty());
    }

    #[test]
    fn test_decode_rejects_channel_mismatch() {
        let post = Postprocessor::new(TaskHead::Detect, 5, 0.5, 0.5, 0.5);
        let lb = Letterbox::new(64, 64, 64, 64);
        let xs = preds(3, &[(10., 10., 4., 4., 0, 0.9)]);
        assert!(matches!(
            post.decode(xs.view(), None, &lb),
            Err(FrameError::Decode(_))
        ));
    }

    #[test]
    fn test_pose_keypoint_visibility() {
        let post = Postprocessor::new(TaskHead::Pose { nk: 2 }, 1, 0.5, 0.5, 0.5);
        let lb = Letterbox::new(64, 64, 64, 64);
        let mut xs = Array2::zeros((4 + 1 + 6, 1));
        for (c, v) in [20., 20., 10., 10., 0.9, 18., 18., 0.8, 22., 22., 0.1]
            .into_iter()
            .enumerate()
        {
            xs[[c, 0]] = v;
        }
        let ys = post.decode(xs.view(), None, &lb).unwrap();
        let kpts = ys[0].keypoints.as_ref().unwrap();
        assert_eq!(kpts.len(), 2);
        assert!(kpts[0].is_visible());
        assert!(!kpts[1].is_visible());
        assert!((kpts[1].x() - 22.).abs() < 1e-6);
    }

    #[test]
    fn test_segment_mask_is_cropped_to_box() {
        let post = Postprocessor::new(TaskHead::Segment { nm: 1 }, 1, 0.5, 0.5, 0.5);
        let lb = Letterbox::new(16, 16, 16, 16);
        let mut xs = Array2::zeros((4 + 1 + 1, 1));
        for (c, v) in [8., 8., 8., 8., 0.9, 1.0].into_iter().enumerate() {
            xs[[c, 0]] = v;
        }
        // 原型: 左半为正, 右半为负
        let mut protos = ndarray::Array3::<f32>::from_elem((1, 4, 4), -5.0);
        protos.slice_mut(s![0, .., 0..2]).fill(5.0);
        let ys = post.decode(xs.view(), Some(protos.view()), &lb).unwrap();
        let mask = ys[0].mask.as_ref().unwrap();
        assert_eq!((mask.x, mask.y, mask.width, mask.height), (4, 4, 8, 8));
        assert!(mask.get(5, 8));
        assert!(!mask.get(10, 8));
        assert!(!mask.get(0, 0));
    }

    #[test]
    fn test_decode_batch_reports_short_output_per_frame() {
        let post = Postprocessor::new(TaskHead::Detect, 1, 0.5, 0.5, 0.5);
        let lb = Letterbox::new(8, 8, 8, 8);
        let outputs = vec![Array::<f32, _>::zeros(IxDyn(&[1, 5, 2]))];
        let ys = post.decode_batch(&outputs, &[lb, lb]);
        assert_eq!(ys.len(), 2);
        assert!(ys.iter().all(|y| y.is_err()));
    }
}
