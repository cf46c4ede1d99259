//! Tracing setup with an optional live-stream tee.
//!
//! Dashboards that follow orchestrator logs in real time get formatted lines
//! over a broadcast channel, on top of (or instead of) stdout.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::MakeWriter;

#[derive(Clone)]
pub struct BroadcastMakeWriter {
    pub sender: tokio::sync::broadcast::Sender<String>,
    pub suppress_stdout: bool,
}

impl<'a> MakeWriter<'a> for BroadcastMakeWriter {
    type Writer = BroadcastWriter;

    fn make_writer(&'a self) -> Self::Writer {
        BroadcastWriter {
            sender: self.sender.clone(),
            suppress_stdout: self.suppress_stdout,
        }
    }
}

pub struct BroadcastWriter {
    sender: tokio::sync::broadcast::Sender<String>,
    suppress_stdout: bool,
}

impl std::io::Write for BroadcastWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if !self.suppress_stdout {
            std::io::stdout().lock().write_all(buf)?;
        }
        // Without receivers the send fails; the line still reached stdout.
        let _ = self.sender.send(String::from_utf8_lossy(buf).into_owned());
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        if self.suppress_stdout {
            return Ok(());
        }
        std::io::stdout().lock().flush()
    }
}

/// Installs the global subscriber. `log_tx` additionally streams formatted
/// lines to live observers. Call once at process start; later calls are
/// ignored.
pub fn init(log_tx: Option<tokio::sync::broadcast::Sender<String>>) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let result = match log_tx {
        Some(sender) => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(BroadcastMakeWriter {
                sender,
                suppress_stdout: false,
            })
            .try_init(),
        None => tracing_subscriber::fmt().with_env_filter(filter).try_init(),
    };
    let _ = result;
}
