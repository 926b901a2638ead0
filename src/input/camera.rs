// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 摄像头设备 (Camera devices)
//!
//! 本地摄像头通过 FFmpeg 子进程采集: DirectShow(Windows) / AVFoundation(macOS) / V4L2(Linux),
//! 输出 rgb24 rawvideo 到管道, 每次读取一整帧。

use std::io::Read;
use std::process::{Child, ChildStdout, Command, Stdio};
use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use crate::error::CaptureError;
use crate::input::RawFrame;
use crate::SourceId;

/// 中断阻塞中的 `grab`, 可从其它线程调用
pub type Interrupt = Arc<dyn Fn() + Send + Sync>;

/// 一个已打开的采集设备, 由读取线程独占
pub trait CameraDevice: Send {
    /// 阻塞读取下一帧
    fn grab(&mut self) -> Result<RawFrame, CaptureError>;

    /// 关闭时用来唤醒卡住的读取; 读取不会无限阻塞的设备返回 None
    fn interrupter(&self) -> Option<Interrupt> {
        None
    }
}

/// 设备工厂: 打开设备 / 枚举可用设备
pub trait DeviceFactory: Send + Sync {
    fn open(&self, id: SourceId) -> Result<Box<dyn CameraDevice>, CaptureError>;

    /// 枚举 `0..limit` 中可打开的摄像头编号
    fn probe(&self, limit: u32) -> Vec<SourceId>;
}

/// FFmpeg 子进程采集参数
#[derive(Debug, Clone)]
pub struct FfmpegFactory {
    width: u32,
    height: u32,
    fps: u32,
}

impl FfmpegFactory {
    pub fn new(width: u32, height: u32, fps: u32) -> Self {
        Self { width, height, fps }
    }

    /// 平台对应的输入格式
    fn input_format() -> &'static str {
        #[cfg(target_os = "windows")]
        let format = "dshow"; // DirectShow

        #[cfg(target_os = "macos")]
        let format = "avfoundation"; // AVFoundation

        #[cfg(target_os = "linux")]
        let format = "v4l2"; // Video4Linux2

        #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
        let format = "video4linux2";

        format
    }

    /// 平台对应的设备地址
    fn input_url(id: SourceId) -> Result<String, CaptureError> {
        #[cfg(target_os = "windows")]
        {
            // dshow 需要设备名
            let names = list_device_names();
            names
                .get(id as usize)
                .map(|name| format!("video={}", name))
                .ok_or_else(|| CaptureError::Open {
                    id,
                    reason: "no such device".into(),
                })
        }
        #[cfg(target_os = "linux")]
        {
            let path = format!("/dev/video{}", id);
            if !std::path::Path::new(&path).exists() {
                return Err(CaptureError::Open {
                    id,
                    reason: format!("{} does not exist", path),
                });
            }
            Ok(path)
        }
        #[cfg(not(any(target_os = "windows", target_os = "linux")))]
        {
            Ok(format!("{}", id))
        }
    }
}

impl DeviceFactory for FfmpegFactory {
    fn open(&self, id: SourceId) -> Result<Box<dyn CameraDevice>, CaptureError> {
        let url = Self::input_url(id)?;
        let mut cmd = Command::new("ffmpeg");
        cmd.arg("-hide_banner")
            .arg("-loglevel")
            .arg("error")
            .arg("-f")
            .arg(Self::input_format())
            .arg("-framerate")
            .arg(self.fps.to_string())
            .arg("-video_size")
            .arg(format!("{}x{}", self.width, self.height))
            .arg("-i")
            .arg(&url)
            .arg("-vf")
            .arg(format!("scale={}:{}", self.width, self.height))
            .arg("-pix_fmt")
            .arg("rgb24")
            .arg("-f")
            .arg("rawvideo")
            .arg("-");
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());

        let mut child = cmd.spawn().map_err(|e| CaptureError::Open {
            id,
            reason: format!("failed to spawn ffmpeg: {e}"),
        })?;
        let stdout = match child.stdout.take() {
            Some(stdout) => stdout,
            None => {
                let _ = child.kill();
                return Err(CaptureError::Open {
                    id,
                    reason: "failed to capture ffmpeg stdout".into(),
                });
            }
        };

        info!(camera = id, %url, "📷 camera opened");
        Ok(Box::new(FfmpegCamera {
            id,
            width: self.width,
            height: self.height,
            child: Arc::new(Mutex::new(child)),
            stdout,
        }))
    }

    fn probe(&self, limit: u32) -> Vec<SourceId> {
        #[cfg(feature = "ffmpeg")]
        {
            let n = list_device_names().len() as u32;
            (0..n.min(limit)).collect()
        }
        #[cfg(all(not(feature = "ffmpeg"), target_os = "linux"))]
        {
            (0..limit)
                .filter(|i| std::path::Path::new(&format!("/dev/video{}", i)).exists())
                .collect()
        }
        #[cfg(all(not(feature = "ffmpeg"), not(target_os = "linux")))]
        {
            // 逐个尝试打开并读取一帧
            (0..limit)
                .filter(|&i| match self.open(i) {
                    Ok(mut dev) => dev.grab().is_ok(),
                    Err(_) => false,
                })
                .collect()
        }
    }
}

/// 通过 ez-ffmpeg 枚举视频输入设备名
#[cfg(feature = "ffmpeg")]
pub fn list_device_names() -> Vec<String> {
    match ez_ffmpeg::device::get_input_video_devices() {
        Ok(devices) => {
            debug!("found {} video devices", devices.len());
            devices
        }
        Err(e) => {
            tracing::warn!("failed to list video devices: {}", e);
            vec![]
        }
    }
}

#[cfg(not(feature = "ffmpeg"))]
pub fn list_device_names() -> Vec<String> {
    debug!("device names unavailable without the ffmpeg feature");
    vec![]
}

pub struct FfmpegCamera {
    id: SourceId,
    width: u32,
    height: u32,
    child: Arc<Mutex<Child>>,
    stdout: ChildStdout,
}

impl CameraDevice for FfmpegCamera {
    fn grab(&mut self) -> Result<RawFrame, CaptureError> {
        let mut buf = vec![0u8; self.width as usize * self.height as usize * 3];
        self.stdout
            .read_exact(&mut buf)
            .map_err(|e| CaptureError::Read {
                id: self.id,
                reason: e.to_string(),
            })?;
        Ok(RawFrame::new(self.width, self.height, buf))
    }

    /// 杀掉 ffmpeg 进程, 管道关闭后 `read_exact` 立即返回
    fn interrupter(&self) -> Option<Interrupt> {
        let child = self.child.clone();
        let id = self.id;
        Some(Arc::new(move || {
            if let Ok(mut child) = child.lock() {
                if let Err(e) = child.kill() {
                    debug!(camera = id, "ffmpeg already exited: {}", e);
                }
            }
        }))
    }
}

impl Drop for FfmpegCamera {
    fn drop(&mut self) {
        if let Ok(mut child) = self.child.lock() {
            let _ = child.kill();
            let _ = child.wait();
        }
        debug!(camera = self.id, "ffmpeg capture stopped");
    }
}
