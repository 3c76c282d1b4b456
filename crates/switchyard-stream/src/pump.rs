//! SSE pump
//!
//! A reader task scans the upstream body line by line and hands each line
//! to the main loop over a bounded channel, so a slow caller slows the
//! upstream read instead of buffering without limit. The main loop groups
//! lines into events at blank-line boundaries, runs the hooks and writes
//! every event through to the caller. An optional pinger task writes
//! keep-alive comments through the same writer lock, so pings never land in
//! the middle of an event.
//!
//! Every exit path stops both tasks and joins them before returning.

use std::io;
use std::sync::Arc;
use std::time::Duration;
use switchyard_observability::Metrics;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, sleep, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{PumpError, Result, TransformError};

const LINE_CHANNEL_CAPACITY: usize = 32;
const DEFAULT_INITIAL_LINE_BYTES: usize = 64 << 10;
const DEFAULT_MAX_LINE_BYTES: usize = 4 << 20;
const PING_FRAME: &[u8] = b": ping\n\n";
const DONE_MARKER: &str = "[DONE]";

type SharedWriter<W> = Arc<Mutex<W>>;

/// Pump tuning; zero values disable the corresponding limit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SsePumpOptions {
    /// Longest accepted line; 0 reads lines of any length
    pub max_line_bytes: usize,
    /// Initial read buffer; 0 uses 64 KiB
    pub initial_line_bytes: usize,
    /// Keep-alive comment interval; zero disables pings
    pub ping_interval: Duration,
    /// Upstream silence that ends the stream; zero disables the timeout
    pub idle_timeout: Duration,
}

impl Default for SsePumpOptions {
    fn default() -> Self {
        Self {
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
            initial_line_bytes: DEFAULT_INITIAL_LINE_BYTES,
            ping_interval: Duration::ZERO,
            idle_timeout: Duration::ZERO,
        }
    }
}

impl SsePumpOptions {
    fn line_limit(&self) -> Option<usize> {
        (self.max_line_bytes > 0).then_some(self.max_line_bytes)
    }

    /// Read buffer size, never above the line limit
    fn read_buffer_bytes(&self) -> usize {
        let initial = if self.initial_line_bytes == 0 {
            DEFAULT_INITIAL_LINE_BYTES
        } else {
            self.initial_line_bytes
        };
        match self.line_limit() {
            Some(limit) => initial.min(limit),
            _ => initial,
        }
    }
}

/// Per-stream callbacks, invoked from the pump's main loop
pub trait SsePumpHooks {
    /// Called with each aggregated `data:` payload; `[DONE]` is never passed
    fn on_data(&mut self, _data: &str) {}

    /// Replace an event's payload with zero or more `data:` events.
    ///
    /// An empty vector or an error relays the original event unchanged.
    /// Events carrying fields other than `data:` and comments (`event:`,
    /// `id:`, `retry:`) are never offered for transformation.
    fn transform_data(&mut self, _data: &str) -> std::result::Result<Vec<String>, TransformError> {
        Ok(Vec::new())
    }
}

impl SsePumpHooks for () {}

/// Counters for one relayed stream
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PumpSummary {
    pub lines: u64,
    /// Data payloads handed to `on_data`
    pub events: u64,
    pub bytes_written: u64,
}

/// Relay of one upstream SSE body to one caller
pub struct SsePump {
    options: SsePumpOptions,
    cancel: CancellationToken,
    deadline: Option<Instant>,
    metrics: Option<Arc<Metrics>>,
}

impl SsePump {
    pub fn new(options: SsePumpOptions) -> Self {
        Self {
            options,
            cancel: CancellationToken::new(),
            deadline: None,
            metrics: None,
        }
    }

    /// Caller cancellation; firing it ends the stream as a client disconnect
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Hard end of the stream
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn options(&self) -> &SsePumpOptions {
        &self.options
    }

    /// Relay `upstream` to `writer` until EOF or a terminal condition.
    ///
    /// The upstream body is dropped (closed) before this returns, whatever
    /// the outcome.
    pub async fn run<R, W, H>(&self, upstream: R, writer: W, hooks: &mut H) -> Result<PumpSummary>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
        H: SsePumpHooks + ?Sized,
    {
        let started = std::time::Instant::now();
        let mut summary = PumpSummary::default();
        let result = self.pump(upstream, writer, hooks, &mut summary).await;

        let error_class = result.as_ref().err().map(PumpError::error_class);
        match &result {
            Ok(()) => debug!(
                lines = summary.lines,
                events = summary.events,
                bytes = summary.bytes_written,
                "SSE stream finished"
            ),
            Err(e) => debug!(
                error_class = %e.error_class(),
                error = %e,
                lines = summary.lines,
                events = summary.events,
                "SSE stream terminated"
            ),
        }
        if let Some(metrics) = &self.metrics {
            metrics.record_stream_outcome(
                error_class.map(|c| c.as_str()),
                summary.events,
                started.elapsed().as_secs_f64(),
            );
        }

        result.map(|()| summary)
    }

    async fn pump<R, W, H>(
        &self,
        upstream: R,
        writer: W,
        hooks: &mut H,
        summary: &mut PumpSummary,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
        H: SsePumpHooks + ?Sized,
    {
        let writer: SharedWriter<W> = Arc::new(Mutex::new(writer));
        let stop = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(LINE_CHANNEL_CAPACITY);

        let reader = tokio::spawn(read_lines(
            BufReader::with_capacity(self.options.read_buffer_bytes(), upstream),
            self.options.line_limit(),
            tx,
            stop.clone(),
        ));
        let pinger = (!self.options.ping_interval.is_zero()).then(|| {
            tokio::spawn(ping_loop(
                writer.clone(),
                self.options.ping_interval,
                stop.clone(),
            ))
        });
        let tasks = Tasks { stop, reader, pinger };

        let idle_timeout = self.options.idle_timeout;
        let idle_enabled = !idle_timeout.is_zero();
        let idle = sleep(idle_timeout);
        tokio::pin!(idle);
        let deadline = sleep_until(self.deadline.unwrap_or_else(Instant::now));
        tokio::pin!(deadline);

        let mut event = EventBuffer::default();
        let exit = loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break Exit::Failed(PumpError::ClientDisconnect),
                _ = &mut deadline, if self.deadline.is_some() => {
                    break Exit::Failed(PumpError::MaxDuration)
                }
                _ = tasks.stop.cancelled() => break Exit::Stopped,
                line = rx.recv() => {
                    let Some(line) = line else {
                        break Exit::Eof;
                    };
                    if idle_enabled {
                        idle.as_mut().reset(Instant::now() + idle_timeout);
                    }
                    summary.lines += 1;
                    let boundary = line.trim_ascii().is_empty();
                    event.push(line);
                    if boundary
                        && let Err(e) = flush_event(&*writer, &mut event, hooks, summary).await
                    {
                        break Exit::Failed(PumpError::Write(e));
                    }
                }
                _ = &mut idle, if idle_enabled => break Exit::Failed(PumpError::IdleTimeout),
            }
        };

        let (read_result, ping_result) = tasks.finish().await;
        match exit {
            Exit::Failed(e) => Err(e),
            Exit::Stopped => ping_result.map_err(PumpError::Write),
            Exit::Eof => {
                match read_result {
                    Ok(()) => {}
                    Err(ReadFailure::TooLong) => return Err(PumpError::EventTooLarge),
                    Err(ReadFailure::Io(e)) => return Err(PumpError::Read(e)),
                }
                // Trailing event without a closing blank line
                if !event.is_empty() {
                    flush_event(&*writer, &mut event, hooks, summary)
                        .await
                        .map_err(PumpError::Write)?;
                }
                Ok(())
            }
        }
    }
}

enum Exit {
    Eof,
    /// The pinger gave up on the writer
    Stopped,
    Failed(PumpError),
}

#[derive(Debug)]
enum ReadFailure {
    TooLong,
    Io(io::Error),
}

struct Tasks {
    stop: CancellationToken,
    reader: JoinHandle<std::result::Result<(), ReadFailure>>,
    pinger: Option<JoinHandle<io::Result<()>>>,
}

impl Tasks {
    /// Stop both tasks and wait for them
    async fn finish(self) -> (std::result::Result<(), ReadFailure>, io::Result<()>) {
        self.stop.cancel();
        let read = self
            .reader
            .await
            .unwrap_or_else(|e| Err(ReadFailure::Io(io::Error::other(e))));
        let ping = match self.pinger {
            Some(pinger) => pinger.await.unwrap_or_else(|e| Err(io::Error::other(e))),
            None => Ok(()),
        };
        (read, ping)
    }
}

/// Lines of the event being assembled.
///
/// Lines keep their raw bytes for the relay. Fields are parsed from a lossy
/// UTF-8 view, so invalid bytes only reach the hooks as replacement chars.
#[derive(Default)]
struct EventBuffer {
    lines: Vec<Vec<u8>>,
    data: String,
    has_data: bool,
    has_other_fields: bool,
}

impl EventBuffer {
    fn push(&mut self, line: Vec<u8>) {
        {
            let text = String::from_utf8_lossy(&line);
            if !is_data_or_comment(&text) {
                self.has_other_fields = true;
            }
            if let Some(data) = parse_data_line(&text)
                && data != DONE_MARKER
            {
                if self.has_data {
                    self.data.push('\n');
                }
                self.data.push_str(data);
                self.has_data = true;
            }
        }
        self.lines.push(line);
    }

    fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    fn reset(&mut self) {
        self.lines.clear();
        self.data.clear();
        self.has_data = false;
        self.has_other_fields = false;
    }
}

/// Payload of a `data:` line, trimmed; `None` for other lines and empty data
fn parse_data_line(line: &str) -> Option<&str> {
    let data = line.trim().strip_prefix("data:")?.trim();
    (!data.is_empty()).then_some(data)
}

fn is_data_or_comment(line: &str) -> bool {
    let trimmed = line.trim();
    trimmed.is_empty() || trimmed.starts_with("data:") || trimmed.starts_with(':')
}

/// Run the hooks on a completed event and write it out
async fn flush_event<W, H>(
    writer: &Mutex<W>,
    event: &mut EventBuffer,
    hooks: &mut H,
    summary: &mut PumpSummary,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    H: SsePumpHooks + ?Sized,
{
    let payload = event.has_data.then(|| std::mem::take(&mut event.data));
    let transformable = !event.has_other_fields;
    let lines = std::mem::take(&mut event.lines);
    event.reset();

    if let Some(payload) = &payload
        && transformable
    {
        match hooks.transform_data(payload) {
            Ok(outputs) if !outputs.is_empty() => {
                let mut w = writer.lock().await;
                for output in outputs {
                    hooks.on_data(&output);
                    summary.events += 1;
                    let frame = format!("data: {}\n\n", output);
                    w.write_all(frame.as_bytes()).await?;
                    w.flush().await?;
                    summary.bytes_written += frame.len() as u64;
                }
                return Ok(());
            }
            Ok(_) => {}
            Err(e) => debug!(error = %e, "SSE transform failed, relaying original event"),
        }
    }

    if let Some(payload) = &payload {
        hooks.on_data(payload);
        summary.events += 1;
    }

    let mut w = writer.lock().await;
    for line in &lines {
        w.write_all(line).await?;
        w.write_all(b"\n").await?;
        summary.bytes_written += line.len() as u64 + 1;
    }
    w.flush().await
}

async fn read_lines<R>(
    mut reader: R,
    limit: Option<usize>,
    lines: mpsc::Sender<Vec<u8>>,
    stop: CancellationToken,
) -> std::result::Result<(), ReadFailure>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    loop {
        let line = tokio::select! {
            biased;
            _ = stop.cancelled() => return Ok(()),
            line = next_line(&mut reader, &mut buf, limit) => line?,
        };
        let Some(line) = line else {
            return Ok(());
        };
        tokio::select! {
            biased;
            _ = stop.cancelled() => return Ok(()),
            sent = lines.send(line) => {
                if sent.is_err() {
                    return Ok(());
                }
            }
        }
    }
}

/// Next line without its terminator; `None` at EOF.
///
/// A final line without a trailing newline is still returned. A trailing
/// `\r` is dropped. Bytes are not checked for UTF-8.
async fn next_line<R>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    limit: Option<usize>,
) -> std::result::Result<Option<Vec<u8>>, ReadFailure>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    loop {
        let (done, used) = {
            let available = reader.fill_buf().await.map_err(ReadFailure::Io)?;
            if available.is_empty() {
                if buf.is_empty() {
                    return Ok(None);
                }
                break;
            }
            match available.iter().position(|b| *b == b'\n') {
                Some(pos) => {
                    buf.extend_from_slice(&available[..pos]);
                    (true, pos + 1)
                }
                None => {
                    buf.extend_from_slice(available);
                    (false, available.len())
                }
            }
        };
        reader.consume(used);
        if limit.is_some_and(|limit| buf.len() > limit) {
            return Err(ReadFailure::TooLong);
        }
        if done {
            break;
        }
    }

    if buf.last() == Some(&b'\r') {
        buf.pop();
    }
    Ok(Some(std::mem::take(buf)))
}

async fn ping_loop<W>(
    writer: SharedWriter<W>,
    interval: Duration,
    stop: CancellationToken,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => return Ok(()),
            _ = ticker.tick() => {}
        }
        let written = tokio::select! {
            biased;
            _ = stop.cancelled() => return Ok(()),
            written = write_ping(&*writer) => written,
        };
        if let Err(e) = written {
            debug!(error = %e, "SSE ping write failed");
            stop.cancel();
            return Err(e);
        }
    }
}

async fn write_ping<W>(writer: &Mutex<W>) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut w = writer.lock().await;
    w.write_all(PING_FRAME).await?;
    w.flush().await
}
