// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 外壳接口 (Shell interface)
//!
//! 命令 (外壳 → 核心) 与事件 (核心 → 外壳), 以 JSON 行传输。
//! `EventSink` 是流水线唯一的对外输出接口。

use std::io::{BufRead, Write};
use std::thread::{self, JoinHandle};

use crossbeam_channel::Sender;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{DestinationId, SourceId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum ShellCommand {
    StartStreaming,
    UpdateRouting {
        destination: DestinationId,
        source: Option<SourceId>,
    },
    PollSources,
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ShellEvent {
    Image {
        destination: DestinationId,
        source: SourceId,
        seq: u64,
        format: String,
        bytes: Vec<u8>,
    },
    Error {
        destination: DestinationId,
        reason: String,
    },
    NoData {
        destination: DestinationId,
    },
    AvailableCameras {
        ids: Vec<SourceId>,
    },
}

impl ShellEvent {
    pub fn destination(&self) -> Option<DestinationId> {
        match self {
            ShellEvent::Image { destination, .. }
            | ShellEvent::Error { destination, .. }
            | ShellEvent::NoData { destination } => Some(*destination),
            ShellEvent::AvailableCameras { .. } => None,
        }
    }
}

/// 事件输出
pub trait EventSink {
    fn emit(&mut self, event: ShellEvent);
}

impl EventSink for Vec<ShellEvent> {
    fn emit(&mut self, event: ShellEvent) {
        self.push(event);
    }
}

impl EventSink for Sender<ShellEvent> {
    fn emit(&mut self, event: ShellEvent) {
        if self.send(event).is_err() {
            debug!("event receiver dropped");
        }
    }
}

/// 每个事件一行 JSON
pub struct JsonLinesSink<W: Write> {
    writer: W,
}

impl<W: Write> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> EventSink for JsonLinesSink<W> {
    fn emit(&mut self, event: ShellEvent) {
        let written = serde_json::to_writer(&mut self.writer, &event)
            .map_err(std::io::Error::from)
            .and_then(|_| self.writer.write_all(b"\n"))
            .and_then(|_| self.writer.flush());
        if let Err(e) = written {
            warn!("failed to write event: {}", e);
        }
    }
}

/// 解析一行命令; 空行返回 None
pub fn parse_command(line: &str) -> Option<Result<ShellCommand, serde_json::Error>> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    Some(serde_json::from_str(line))
}

/// 后台线程逐行读取命令, 输入结束时关闭通道
pub fn spawn_command_reader<R>(reader: R, tx: Sender<ShellCommand>) -> std::io::Result<JoinHandle<()>>
where
    R: BufRead + Send + 'static,
{
    thread::Builder::new()
        .name("shell-commands".into())
        .spawn(move || {
            for line in reader.lines() {
                let line = match line {
                    Ok(line) => line,
                    Err(e) => {
                        warn!("failed to read command: {}", e);
                        break;
                    }
                };
                match parse_command(&line) {
                    Some(Ok(cmd)) => {
                        if tx.send(cmd).is_err() {
                            return;
                        }
                    }
                    Some(Err(e)) => warn!("ignoring invalid command {:?}: {}", line, e),
                    None => {}
                }
            }
            // 输入结束: 通道随线程退出而断开
            debug!("command input closed");
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        assert_eq!(
            parse_command(r#"{"cmd": "update_routing", "destination": 1, "source": 4}"#)
                .unwrap()
                .unwrap(),
            ShellCommand::UpdateRouting {
                destination: 1,
                source: Some(4)
            }
        );
        assert_eq!(
            parse_command(r#"{"cmd": "update_routing", "destination": 0, "source": null}"#)
                .unwrap()
                .unwrap(),
            ShellCommand::UpdateRouting {
                destination: 0,
                source: None
            }
        );
        assert_eq!(
            parse_command(r#"{"cmd":"poll_sources"}"#).unwrap().unwrap(),
            ShellCommand::PollSources
        );
        assert!(parse_command("   ").is_none());
        assert!(parse_command("{\"cmd\": \"reboot\"}").unwrap().is_err());
    }

    #[test]
    fn test_json_lines_sink() {
        let mut sink = JsonLinesSink::new(Vec::new());
        sink.emit(ShellEvent::NoData { destination: 2 });
        sink.emit(ShellEvent::AvailableCameras { ids: vec![0, 1] });
        let out = String::from_utf8(sink.into_inner()).unwrap();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], r#"{"event":"no_data","destination":2}"#);
        assert_eq!(lines[1], r#"{"event":"available_cameras","ids":[0,1]}"#);
    }

    #[test]
    fn test_reader_disconnects_at_eof() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let input = std::io::Cursor::new("{\"cmd\":\"start_streaming\"}\nnot json\n");
        spawn_command_reader(input, tx).unwrap().join().unwrap();
        assert_eq!(rx.try_recv(), Ok(ShellCommand::StartStreaming));
        assert_eq!(
            rx.try_recv(),
            Err(crossbeam_channel::TryRecvError::Disconnected)
        );
    }
}
