//! Retry-narrative transport.
//!
//! Every attempt of a retried test produces one [`AttemptFrame`]; the
//! frames for a session accumulate in a [`ReportSink`] and are rendered as
//! a single titled section at session end. Three sinks cover the three
//! process roles:
//!
//! - [`OfflineSink`] - single-process runs; frames stay in memory
//! - [`ReportServer`] - the controller of a multi-worker run; accepts one
//!   loopback connection per worker and appends whatever arrives
//! - [`ReportClient`] - a worker; buffers frames locally and ships a
//!   test's complete narrative as one write when its closing frame lands
//!
//! The wire format is opaque UTF-8 with no framing. Contiguity of a
//! test's narrative on the controller is guaranteed by the client-side
//! batching (one send per test) together with the server draining one
//! connection at a time.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::host::Terminal;

/// Title of the session-end retry section.
pub const RETRY_REPORT_TITLE: &str = "the following tests were retried";
/// Footer closing the session-end retry section.
pub const RETRY_REPORT_FOOTER: &str = "end of test retry report";

const FRAME_SEPARATOR: &str = "\n\n";
/// Interim frames end their message with this suffix; anything else
/// closes the test's narrative.
const CONTINUATION_SUFFIX: &str = "Retrying!\n\t";

/// One attempt's worth of narrative: the indented test name, the attempt
/// message, and the formatted traceback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptFrame {
    pub name_line: String,
    pub message: String,
    pub trace: String,
}

impl AttemptFrame {
    pub fn new(
        name_line: impl Into<String>,
        message: impl Into<String>,
        trace: impl Into<String>,
    ) -> Self {
        Self {
            name_line: name_line.into(),
            message: message.into(),
            trace: trace.into(),
        }
    }

    /// Whether this frame closes its test's narrative (pass-on-retry,
    /// final failure, or teardown exit).
    pub fn is_final(&self) -> bool {
        !self.message.ends_with(CONTINUATION_SUFFIX)
    }

    pub fn render(&self) -> String {
        format!(
            "{}{}{}{}",
            self.name_line, self.message, self.trace, FRAME_SEPARATOR
        )
    }
}

/// Sink for the retry narrative.
#[async_trait]
pub trait ReportSink: Send + Sync {
    /// Accepts one attempt frame.
    async fn record_attempt(&self, frame: AttemptFrame);

    /// The accumulated narrative so far.
    async fn contents(&self) -> String;

    /// Releases transport resources. Idempotent; called at session end.
    async fn shutdown(&self) {}

    /// Renders the accumulated narrative as a titled section, if any.
    async fn flush_to(&self, terminal: &mut dyn Terminal) {
        let contents = self.contents().await;
        if contents.is_empty() {
            return;
        }
        terminal.write("\n");
        terminal.section(RETRY_REPORT_TITLE);
        terminal.write(&contents);
        terminal.section(RETRY_REPORT_FOOTER);
        terminal.write("\n");
    }
}

/// In-memory sink for single-process sessions.
#[derive(Debug, Default)]
pub struct OfflineSink {
    buffer: std::sync::Mutex<String>,
}

impl OfflineSink {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ReportSink for OfflineSink {
    async fn record_attempt(&self, frame: AttemptFrame) {
        self.buffer
            .lock()
            .expect("narrative lock poisoned")
            .push_str(&frame.render());
    }

    async fn contents(&self) -> String {
        self.buffer.lock().expect("narrative lock poisoned").clone()
    }
}

/// The controller-side collector for multi-worker runs.
///
/// Binds a loopback socket on a kernel-assigned port; a background task
/// accepts each worker connection in turn and reads it to EOF into the
/// shared buffer. Draining one connection at a time keeps each worker's
/// writes contiguous.
pub struct ReportServer {
    buffer: Arc<std::sync::Mutex<String>>,
    port: u16,
    shutdown_tx: watch::Sender<bool>,
    accept_task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl ReportServer {
    /// Binds on `127.0.0.1:0` and starts the accept task.
    pub async fn bind() -> std::io::Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
        let port = listener.local_addr()?.port();
        debug!(port, "retry report server listening");

        let buffer = Arc::new(std::sync::Mutex::new(String::new()));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let accept_buffer = Arc::clone(&buffer);
        let task = tokio::spawn(accept_loop(listener, accept_buffer, shutdown_rx));

        Ok(Self {
            buffer,
            port,
            shutdown_tx,
            accept_task: tokio::sync::Mutex::new(Some(task)),
        })
    }

    /// The kernel-assigned port workers connect to.
    pub fn port(&self) -> u16 {
        self.port
    }
}

async fn accept_loop(
    listener: TcpListener,
    buffer: Arc<std::sync::Mutex<String>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let stream = tokio::select! {
            // Established connections are drained before shutdown wins.
            biased;
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    debug!(%addr, "retry report connection accepted");
                    stream
                }
                Err(err) => {
                    warn!("retry report accept failed: {err}");
                    break;
                }
            },
            _ = shutdown.wait_for(|stop| *stop) => break,
        };
        drain_connection(stream, &buffer, shutdown.clone()).await;
    }
    debug!("retry report server stopped");
}

async fn drain_connection(
    mut stream: TcpStream,
    buffer: &std::sync::Mutex<String>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut chunk = [0u8; 1024];
    loop {
        let read = tokio::select! {
            // Buffered bytes are appended before shutdown cuts the
            // connection off.
            biased;
            read = stream.read(&mut chunk) => read,
            _ = shutdown.wait_for(|stop| *stop) => break,
        };
        match read {
            Ok(0) => break,
            Ok(n) => {
                let text = String::from_utf8_lossy(&chunk[..n]).into_owned();
                buffer
                    .lock()
                    .expect("narrative lock poisoned")
                    .push_str(&text);
            }
            Err(err) => {
                warn!("retry report read failed: {err}");
                break;
            }
        }
    }
}

#[async_trait]
impl ReportSink for ReportServer {
    async fn record_attempt(&self, frame: AttemptFrame) {
        // The controller rarely runs tests itself, but nothing is lost if
        // it does.
        self.buffer
            .lock()
            .expect("narrative lock poisoned")
            .push_str(&frame.render());
    }

    async fn contents(&self) -> String {
        self.buffer.lock().expect("narrative lock poisoned").clone()
    }

    async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let task = self.accept_task.lock().await.take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                warn!("retry report server task failed: {err}");
            }
        }
    }
}

struct ClientState {
    stream: Option<TcpStream>,
    pending: String,
}

/// The worker-side sink.
///
/// Frames accumulate locally; when a test's closing frame arrives the
/// whole narrative is written in one piece so the controller can never
/// observe a test's frames interleaved with another worker's.
pub struct ReportClient {
    state: tokio::sync::Mutex<ClientState>,
}

impl ReportClient {
    /// Connects to the controller's report server.
    pub async fn connect(port: u16) -> std::io::Result<Self> {
        let stream = TcpStream::connect(("127.0.0.1", port)).await?;
        debug!(port, "retry report client connected");
        Ok(Self {
            state: tokio::sync::Mutex::new(ClientState {
                stream: Some(stream),
                pending: String::new(),
            }),
        })
    }

    async fn send_pending(state: &mut ClientState) {
        if state.pending.is_empty() {
            return;
        }
        let Some(stream) = state.stream.as_mut() else {
            return;
        };
        let payload = std::mem::take(&mut state.pending);
        if let Err(err) = stream.write_all(payload.as_bytes()).await {
            // Tests are authoritative; the narrative is best-effort.
            warn!("failed to stream retry narrative: {err}");
            state.pending = payload;
        }
    }
}

#[async_trait]
impl ReportSink for ReportClient {
    async fn record_attempt(&self, frame: AttemptFrame) {
        let mut state = self.state.lock().await;
        let is_final = frame.is_final();
        state.pending.push_str(&frame.render());
        if is_final {
            Self::send_pending(&mut state).await;
        }
    }

    async fn contents(&self) -> String {
        self.state.lock().await.pending.clone()
    }

    async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        Self::send_pending(&mut state).await;
        if let Some(mut stream) = state.stream.take() {
            if let Err(err) = stream.shutdown().await {
                debug!("retry report client close: {err}");
            }
        }
    }
}

/// [`Terminal`] implementation writing to stdout with `console` styling.
pub struct ConsoleTerminal {
    width: usize,
}

impl ConsoleTerminal {
    pub fn new() -> Self {
        let width = console::Term::stdout().size().1 as usize;
        Self {
            width: if width == 0 { 80 } else { width },
        }
    }
}

impl Default for ConsoleTerminal {
    fn default() -> Self {
        Self::new()
    }
}

impl Terminal for ConsoleTerminal {
    fn section(&mut self, title: &str) {
        let fill = self.width.saturating_sub(title.len() + 2);
        let left = fill / 2;
        let right = fill - left;
        let line = format!("{} {} {}", "=".repeat(left), title, "=".repeat(right));
        println!("{}", console::style(line).bold().yellow());
    }

    fn write(&mut self, text: &str) {
        print!("{text}");
    }
}
