use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use pulsemeter_domain::TransportConfig;
use pulsemeter_ports::{Delivery, DeliveryTag, EventTransport};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JsonLinesSource {
    Stdin,
    File(PathBuf),
}

impl From<&TransportConfig> for JsonLinesSource {
    fn from(config: &TransportConfig) -> Self {
        match config {
            TransportConfig::Stdin => JsonLinesSource::Stdin,
            TransportConfig::Jsonl { path } => JsonLinesSource::File(path.clone()),
        }
    }
}

type LineReader = Lines<Pin<Box<dyn AsyncBufRead + Send>>>;

enum ReaderState {
    Idle,
    Open(LineReader),
    /// Exhausted, unreadable or disconnected. Never reopened, so line tags
    /// keep matching file positions.
    Ended,
}

/// One JSON event per line from a file or stdin; the tag is the line number.
///
/// Blank lines are skipped. Acknowledgements only advance a counter since a
/// line source cannot redeliver. A read error ends the stream.
pub struct JsonLinesTransport {
    source: JsonLinesSource,
    lines: Mutex<ReaderState>,
    line_no: AtomicU64,
    acked: AtomicU64,
}

impl JsonLinesTransport {
    pub fn new(source: JsonLinesSource) -> Self {
        Self {
            source,
            lines: Mutex::new(ReaderState::Idle),
            line_no: AtomicU64::new(0),
            acked: AtomicU64::new(0),
        }
    }

    pub fn from_config(config: &TransportConfig) -> Self {
        Self::new(JsonLinesSource::from(config))
    }

    pub fn acked(&self) -> u64 {
        self.acked.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl EventTransport for JsonLinesTransport {
    async fn connect(&self) -> Result<()> {
        let mut lines = self.lines.lock().await;
        if !matches!(*lines, ReaderState::Idle) {
            return Ok(());
        }
        let reader: Pin<Box<dyn AsyncBufRead + Send>> = match &self.source {
            JsonLinesSource::Stdin => Box::pin(BufReader::new(tokio::io::stdin())),
            JsonLinesSource::File(path) => {
                let file = tokio::fs::File::open(path)
                    .await
                    .with_context(|| format!("failed to open event file {}", path.display()))?;
                Box::pin(BufReader::new(file))
            }
        };
        *lines = ReaderState::Open(reader.lines());
        info!(source = ?self.source, "json-lines transport connected");
        Ok(())
    }

    async fn recv(&self) -> Result<Option<Delivery>> {
        let mut state = self.lines.lock().await;
        let lines = match &mut *state {
            ReaderState::Idle => bail!("json-lines transport is not connected"),
            ReaderState::Ended => return Ok(None),
            ReaderState::Open(lines) => lines,
        };
        loop {
            let next = match lines.next_line().await {
                Ok(next) => next,
                Err(err) => {
                    let after = self.line_no.load(Ordering::Relaxed);
                    warn!(after_line = after, "json-lines source unreadable, ending stream: {err}");
                    *state = ReaderState::Ended;
                    return Ok(None);
                }
            };
            let Some(line) = next else {
                debug!("json-lines source exhausted");
                *state = ReaderState::Ended;
                return Ok(None);
            };
            let tag = self.line_no.fetch_add(1, Ordering::Relaxed) + 1;
            if line.trim().is_empty() {
                continue;
            }
            return Ok(Some(Delivery::new(tag, line)));
        }
    }

    async fn ack(&self, _tag: DeliveryTag) -> Result<()> {
        self.acked.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let mut state = self.lines.lock().await;
        if matches!(*state, ReaderState::Open(_)) {
            *state = ReaderState::Ended;
        }
        Ok(())
    }
}
