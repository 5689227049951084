//! Log lines go to stderr so stdout stays free for the one-line run summary.

use serde::Serialize;
use std::io::{self, Write};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Final stdout line of a run: `status` is `ok` with the run summary, or
/// `error` with the message that failed the run.
#[derive(Serialize)]
pub struct RunEvent<'a, T: Serialize> {
    pub ts: String,
    pub status: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<&'a T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<&'a str>,
}

impl<'a, T: Serialize> RunEvent<'a, T> {
    pub fn ok(summary: &'a T) -> Self {
        Self {
            ts: chrono::Utc::now().to_rfc3339(),
            status: "ok",
            summary: Some(summary),
            error: None,
        }
    }

    pub fn failed(error: &'a str) -> Self {
        Self {
            ts: chrono::Utc::now().to_rfc3339(),
            status: "error",
            summary: None,
            error: Some(error),
        }
    }

    /// Serialize as one newline-terminated JSON line and flush, so a
    /// wrapping process sees the outcome before exit.
    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        serde_json::to_writer(&mut *w, self)?;
        w.write_all(b"\n")?;
        w.flush()
    }
}

pub struct StructuredLogger;

impl StructuredLogger {
    /// Route pipeline logs to stderr, as JSON lines when `json` is set.
    /// `RUST_LOG` takes precedence over the configured level; only the first
    /// call in a process installs anything.
    pub fn init(json: bool, default_level: &str) {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
        let result = if json {
            let fmt = tracing_subscriber::fmt::layer()
                .json()
                .with_span_events(FmtSpan::NONE)
                .with_writer(std::io::stderr);
            tracing_subscriber::registry().with(filter).with(fmt).try_init()
        } else {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .try_init()
        };
        if result.is_err() {
            tracing::debug!("tracing subscriber already installed");
        }
    }
}
