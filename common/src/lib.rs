pub mod error;
pub mod json_file;
pub mod units;

pub use error::{CommonError, Result};
pub use units::{format_bytes, format_duration};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{EnvFilter, fmt};

/// Installs the global subscriber. Logs go to a daily rolling file under
/// `log_dir` when set, otherwise to stdout. `RUST_LOG` overrides `log_level`.
pub fn init_tracing(
    log_dir: Option<&str>,
    log_file: &str,
    log_level: &str,
    console_port: Option<u16>,
) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let (writer, guard, ansi) = match log_dir {
        Some(log_dir) => {
            let file_appender = tracing_appender::rolling::daily(log_dir, log_file);
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            (BoxMakeWriter::new(non_blocking), Some(guard), false)
        }
        None => (BoxMakeWriter::new(std::io::stdout), None, true),
    };

    let registry = tracing_subscriber::registry().with(filter).with(
        fmt::layer()
            .with_writer(writer)
            .with_target(true)
            .with_thread_ids(true)
            .with_line_number(true)
            .with_ansi(ansi),
    );

    #[cfg(feature = "console")]
    {
        let console_layer = console_port.map(|port| {
            console_subscriber::ConsoleLayer::builder()
                .server_addr((std::net::Ipv4Addr::LOCALHOST, port))
                .spawn()
        });
        registry.with(console_layer).init();
    }

    #[cfg(not(feature = "console"))]
    {
        if console_port.is_some() {
            eprintln!(
                "console_port is configured but the binary is not built with --features console; tokio-console is disabled"
            );
        }
        registry.init();
    }

    guard
}
