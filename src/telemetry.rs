// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 日志初始化; 输出到 stderr, stdout 留给事件流
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

/// `RUST_LOG` 优先, 否则 info (verbose 时 debug)
pub fn init(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(false)
                .with_timer(fmt::time::uptime())
                .with_writer(std::io::stderr)
                .with_filter(filter),
        )
        .try_init();
}
