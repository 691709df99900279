//! Turns the child's output into lifecycle events.
//!
//! The patterns live in [`Sentinels`] so a server that words its status
//! lines differently only needs a new value, not a new state machine.

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::output::{Console, OutputCapture};
use crate::types::{ReadinessEvent, Stream};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sentinels {
	pub ready: String,
	pub fatal: String,
}

impl Default for Sentinels {
	fn default() -> Self {
		Self {
			ready: "STARTED".to_string(),
			fatal: "FATAL".to_string(),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineClass {
	Ready,
	/// Text from the fatal sentinel to the end of the line.
	Fatal(String),
	Ignored,
}

#[derive(Debug, Clone, Default)]
pub struct Classifier {
	sentinels: Sentinels,
}

impl Classifier {
	pub fn new(sentinels: Sentinels) -> Self {
		Self { sentinels }
	}

	pub fn sentinels(&self) -> &Sentinels {
		&self.sentinels
	}

	pub fn classify(&self, line: &str) -> LineClass {
		if let Some(pos) = line.find(&self.sentinels.fatal) {
			return LineClass::Fatal(line[pos..].trim_end().to_string());
		}
		if line.contains(&self.sentinels.ready) {
			return LineClass::Ready;
		}
		LineClass::Ignored
	}
}

/// Background consumer for one child's stdout and stderr.
pub struct Reader {
	classifier: Classifier,
	output: OutputCapture,
	console: Console,
	verbose: bool,
	quiet: bool,
}

impl Reader {
	pub fn new(classifier: Classifier, output: OutputCapture, console: Console) -> Self {
		Self {
			classifier,
			output,
			console,
			verbose: false,
			quiet: false,
		}
	}

	/// Forward unclassified lines to `tracing` under `nakime::child`.
	pub fn verbose(mut self, verbose: bool) -> Self {
		self.verbose = verbose;
		self
	}

	/// Stop echoing child stderr and failure reports to the console.
	pub fn quiet(mut self, quiet: bool) -> Self {
		self.quiet = quiet;
		self
	}

	/// Start reading. The receiver resolves exactly once; the task keeps
	/// draining both streams until they close so the child never blocks on a
	/// full pipe.
	pub fn spawn<O, E>(self, stdout: O, stderr: E) -> (oneshot::Receiver<ReadinessEvent>, JoinHandle<()>)
	where
		O: AsyncRead + Unpin + Send + 'static,
		E: AsyncRead + Unpin + Send + 'static,
	{
		let (tx, rx) = oneshot::channel();
		let handle = tokio::spawn(self.run(stdout, stderr, tx));
		(rx, handle)
	}

	async fn run<O, E>(self, stdout: O, stderr: E, tx: oneshot::Sender<ReadinessEvent>)
	where
		O: AsyncRead + Unpin,
		E: AsyncRead + Unpin,
	{
		let mut notify = Some(tx);
		let mut out = LineSource::new(stdout);
		let mut err = LineSource::new(stderr);

		while out.open || err.open {
			let (out_open, err_open) = (out.open, err.open);
			let (stream, line) = tokio::select! {
				line = out.next_line(), if out_open => (Stream::Stdout, line),
				line = err.next_line(), if err_open => (Stream::Stderr, line),
			};
			if let Some(line) = line {
				self.handle(stream, line, &mut notify).await;
			}
		}

		if let Some(tx) = notify.take() {
			tracing::debug!("child output closed before readiness");
			let _ = tx.send(ReadinessEvent::StreamClosed);
		}
	}

	async fn handle(
		&self,
		stream: Stream,
		line: String,
		notify: &mut Option<oneshot::Sender<ReadinessEvent>>,
	) {
		self.output.write_line(stream, &line).await;

		let class = if notify.is_some() {
			self.classifier.classify(&line)
		} else {
			LineClass::Ignored
		};

		match class {
			LineClass::Ready => {
				tracing::debug!("readiness sentinel on {}: {}", stream.as_str(), line);
				if let Some(tx) = notify.take() {
					let _ = tx.send(ReadinessEvent::Ready);
				}
			}
			LineClass::Fatal(message) => {
				tracing::debug!("fatal sentinel on {}: {}", stream.as_str(), line);
				if !self.quiet {
					self.console.line(&format!("LDAP server process failed: {}", message));
				}
				if let Some(tx) = notify.take() {
					let _ = tx.send(ReadinessEvent::FatalError(message));
				}
			}
			LineClass::Ignored => {
				if self.verbose {
					tracing::info!(target: "nakime::child", stream = stream.as_str(), "{}", line);
				}
				if stream == Stream::Stderr && !self.quiet {
					self.console.line(&line);
				}
			}
		}
	}
}

/// Longer lines are split into pieces of this size.
const MAX_LINE_LEN: usize = 64 * 1024;

struct LineSource<R> {
	reader: BufReader<R>,
	buf: Vec<u8>,
	open: bool,
}

impl<R: AsyncRead + Unpin> LineSource<R> {
	fn new(reader: R) -> Self {
		Self {
			reader: BufReader::new(reader),
			buf: Vec::new(),
			open: true,
		}
	}

	// Partial reads stay in `buf` when the future is dropped by `select!`, so
	// the next call picks up where this one stopped. `buf` never exceeds
	// MAX_LINE_LEN: a full buffer is returned as a line of its own.
	async fn next_line(&mut self) -> Option<String> {
		let room = (MAX_LINE_LEN - self.buf.len()) as u64;
		match (&mut self.reader).take(room).read_until(b'\n', &mut self.buf).await {
			Ok(0) | Err(_) => {
				self.open = false;
				if self.buf.is_empty() {
					return None;
				}
			}
			Ok(_) => {}
		}
		let line = String::from_utf8_lossy(&self.buf)
			.trim_end_matches(['\r', '\n'])
			.to_string();
		self.buf.clear();
		Some(line)
	}
}
