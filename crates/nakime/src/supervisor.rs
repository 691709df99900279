use nix::sys::signal::Signal;
use std::ffi::OsString;
use std::future::Future;
use std::io;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU16, AtomicU32, Ordering};
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::futures::Notified;
use tokio::sync::{oneshot, watch, Mutex, Notify};
use tokio::task::JoinHandle;

use crate::config::StartupDescriptor;
use crate::error::Error;
use crate::guard::ProcessGroup;
use crate::logs;
use crate::output::{Console, OutputCapture, DEFAULT_MAX_TRANSCRIPT_SIZE};
use crate::readiness::{Classifier, Reader, Sentinels};
use crate::types::{ReadinessEvent, ServerState};

/// How long each step of `stop()` waits before escalating: STOP on stdin,
/// then SIGTERM to the group, then SIGKILL.
pub const STOP_GRACE: Duration = Duration::from_secs(3);
const READER_DRAIN: Duration = Duration::from_millis(500);

/// One directory server, started and stopped as many times as needed.
///
/// `start` and `stop` take `&self` and serialize on an internal lock, so a
/// server can be shared across threads (for example in an `Arc`) and stopped
/// from a cleanup path other than the one that started it.
pub struct Server {
	descriptor: StartupDescriptor,
	classifier: Classifier,
	console: Console,
	output: OutputCapture,
	lifecycle: Mutex<Lifecycle>,
	state: watch::Sender<ServerState>,
	/// Wakes a `start` that is still waiting for readiness.
	cancel_start: Notify,
	active_port: AtomicU16,
	active_pid: AtomicU32,
}

impl std::fmt::Debug for Server {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Server")
			.field("descriptor", &self.descriptor)
			.finish_non_exhaustive()
	}
}

#[derive(Default)]
struct Lifecycle {
	process: Option<SupervisedProcess>,
	last_exit: Option<ExitStatus>,
}

struct SupervisedProcess {
	child: Child,
	stdin: Option<ChildStdin>,
	group: ProcessGroup,
	pid: u32,
	port: u16,
	reader: JoinHandle<()>,
	started_at: Instant,
}

impl Server {
	pub fn new(descriptor: StartupDescriptor) -> Self {
		Self::with_console(descriptor, Console::stderr())
	}

	/// Like [`Server::new`], writing progress and child stderr to `console`
	/// instead of the process's stderr.
	pub fn with_console(descriptor: StartupDescriptor, console: Console) -> Self {
		let output = OutputCapture::new(None, DEFAULT_MAX_TRANSCRIPT_SIZE);
		let (state, _) = watch::channel(ServerState::Idle);

		Self {
			descriptor,
			classifier: Classifier::default(),
			console,
			output,
			lifecycle: Mutex::new(Lifecycle::default()),
			state,
			cancel_start: Notify::new(),
			active_port: AtomicU16::new(0),
			active_pid: AtomicU32::new(0),
		}
	}

	pub fn with_sentinels(mut self, sentinels: Sentinels) -> Self {
		self.classifier = Classifier::new(sentinels);
		self
	}

	pub fn descriptor(&self) -> &StartupDescriptor {
		&self.descriptor
	}

	/// The port the running child listens on, or the configured port when
	/// idle.
	pub fn port(&self) -> u16 {
		match self.active_port.load(Ordering::SeqCst) {
			0 => self.descriptor.port(),
			port => port,
		}
	}

	pub fn pid(&self) -> Option<u32> {
		match self.active_pid.load(Ordering::SeqCst) {
			0 => None,
			pid => Some(pid),
		}
	}

	pub fn state(&self) -> ServerState {
		*self.state.borrow()
	}

	pub fn is_running(&self) -> bool {
		self.state().is_running()
	}

	pub fn subscribe_state(&self) -> watch::Receiver<ServerState> {
		self.state.subscribe()
	}

	pub fn output(&self) -> &OutputCapture {
		&self.output
	}

	/// Exit status of the child from the most recent `stop()`.
	pub async fn last_exit(&self) -> Option<ExitStatus> {
		self.lifecycle.lock().await.last_exit
	}

	/// Start the child and wait until it reports readiness.
	///
	/// Returns immediately if already running. On a fatal line, a silent
	/// exit or the timeout, the child's process group is killed before the
	/// error is returned and the server is idle again. When the timeout and a
	/// readiness event land in the same poll, the timeout wins. A `stop()`
	/// from another task while starting ends the attempt with
	/// [`Error::StartupCancelled`].
	pub async fn start(&self) -> Result<&Self, Error> {
		let mut lifecycle = self.lifecycle.lock().await;
		if lifecycle.process.is_some() {
			tracing::debug!("already running on port {}", self.port());
			return Ok(self);
		}

		// Registered before `Starting` is published, so any stop() that sees
		// `Starting` wakes this attempt.
		let cancelled = self.cancel_start.notified();
		let transition = Transition::enter(&self.state, ServerState::Starting, ServerState::Idle);
		let process = self.launch(cancelled).await?;

		self.active_port.store(process.port, Ordering::SeqCst);
		self.active_pid.store(process.pid, Ordering::SeqCst);
		tracing::info!(
			"LDAP server ready on port {} (pid {}, {} ms)",
			process.port,
			process.pid,
			process.started_at.elapsed().as_millis()
		);
		lifecycle.process = Some(process);
		transition.finish(ServerState::Running);
		Ok(self)
	}

	/// Stop the child and reap it. A no-op when idle; never fails, teardown
	/// trouble is logged and escalated instead. While starting, the pending
	/// `start` is cancelled and its process group killed.
	pub async fn stop(&self) {
		if self.state() == ServerState::Starting {
			tracing::info!("stop() while starting; cancelling startup");
			self.cancel_start.notify_waiters();
		}
		let mut lifecycle = self.lifecycle.lock().await;
		let Some(process) = lifecycle.process.take() else {
			return;
		};

		let transition = Transition::enter(&self.state, ServerState::Stopping, ServerState::Idle);
		if !self.descriptor.is_quiet() {
			self.console.line(&format!("Stopping LDAP server on port {}", process.port));
		}
		let pid = process.pid;
		let uptime = process.started_at.elapsed().as_secs();

		lifecycle.last_exit = process.shutdown().await;
		self.active_port.store(0, Ordering::SeqCst);
		self.active_pid.store(0, Ordering::SeqCst);
		tracing::info!("LDAP server (pid {}) stopped after {}s", pid, uptime);
		drop(transition);
	}

	async fn launch(&self, cancelled: Notified<'_>) -> Result<SupervisedProcess, Error> {
		let deadline = tokio::time::sleep(self.descriptor.timeout());

		let port = resolve_port(self.descriptor.port())?;
		if !self.descriptor.is_quiet() {
			self.console.line(&format!("Starting LDAP server on port {}", port));
		}
		if let Some(dir) = self.descriptor.log_dir() {
			self.output
				.open_transcript(dir, &logs::transcript_stem(port), DEFAULT_MAX_TRANSCRIPT_SIZE)
				.await;
		}
		tracing::info!("starting LDAP server on port {}", port);
		tracing::debug!("server command: {}", self.descriptor.display_command(port));

		let mut child = spawn_child(&self.descriptor.command_line(port), self.descriptor.tmpdir())?;
		let pid = child
			.id()
			.ok_or_else(|| io::Error::other("child exited before it could be tracked"))?;
		let group = ProcessGroup::adopt(pid);

		let (stdout, stderr) = match (child.stdout.take(), child.stderr.take()) {
			(Some(stdout), Some(stderr)) => (stdout, stderr),
			_ => return Err(io::Error::other("child output is not piped").into()),
		};
		let (events, reader) = Reader::new(self.classifier.clone(), self.output.clone(), self.console.clone())
			.verbose(self.descriptor.is_verbose())
			.quiet(self.descriptor.is_quiet())
			.spawn(stdout, stderr);

		let stdin = child.stdin.take();
		let process = SupervisedProcess {
			child,
			stdin,
			group,
			pid,
			port,
			reader,
			started_at: Instant::now(),
		};

		match await_readiness(deadline, cancelled, events).await {
			Outcome::Event(ReadinessEvent::Ready) => Ok(process),
			Outcome::Event(ReadinessEvent::FatalError(message)) => {
				tracing::warn!("LDAP server (pid {}) reported a fatal error: {}", pid, message);
				process.kill().await;
				Err(Error::StartupFailure { message })
			}
			Outcome::Event(ReadinessEvent::StreamClosed) => {
				let message = match process.kill().await {
					Some(status) => format!("process exited ({}) before reporting readiness", status),
					None => "process closed its output before reporting readiness".to_string(),
				};
				tracing::warn!("LDAP server (pid {}): {}", pid, message);
				Err(Error::StartupFailure { message })
			}
			Outcome::Cancelled => {
				tracing::info!("startup of pid {} cancelled; killing process group", pid);
				process.kill().await;
				Err(Error::StartupCancelled)
			}
			Outcome::TimedOut => {
				let timeout = self.descriptor.timeout();
				tracing::warn!(
					"LDAP server (pid {}) not ready within {}s; killing process group",
					pid,
					timeout.as_secs()
				);
				process.kill().await;
				Err(Error::StartupTimeout { timeout })
			}
		}
	}
}

#[derive(Debug, PartialEq, Eq)]
enum Outcome {
	Event(ReadinessEvent),
	TimedOut,
	Cancelled,
}

/// Races cancellation, the deadline and the reader. Polled in that order, so
/// a timeout observed together with a readiness event wins.
async fn await_readiness(
	deadline: impl Future<Output = ()>,
	cancelled: impl Future<Output = ()>,
	events: oneshot::Receiver<ReadinessEvent>,
) -> Outcome {
	tokio::select! {
		biased;
		_ = cancelled => Outcome::Cancelled,
		_ = deadline => Outcome::TimedOut,
		event = events => Outcome::Event(event.unwrap_or(ReadinessEvent::StreamClosed)),
	}
}

impl Drop for Server {
	fn drop(&mut self) {
		if let Some(process) = self.lifecycle.get_mut().process.take() {
			tracing::warn!(
				"server on port {} dropped without stop(); killing process group {}",
				process.port,
				process.group.id()
			);
			drop(process);
		}
	}
}

impl SupervisedProcess {
	/// SIGKILL the whole group and reap.
	async fn kill(mut self) -> Option<ExitStatus> {
		self.group.signal(Signal::SIGKILL);
		let status = self.reap(STOP_GRACE).await;
		self.retire_reader().await;
		status
	}

	async fn shutdown(mut self) -> Option<ExitStatus> {
		if let Some(mut stdin) = self.stdin.take() {
			let _ = stdin.write_all(b"STOP\n").await;
			let _ = stdin.flush().await;
		}

		let mut status = self.reap(STOP_GRACE).await;
		if status.is_none() {
			tracing::warn!(
				"pid {} still running {}s after STOP; sending SIGTERM to process group {}",
				self.pid,
				STOP_GRACE.as_secs(),
				self.group.id()
			);
			self.group.signal(Signal::SIGTERM);
			status = self.reap(STOP_GRACE).await;
		}
		if status.is_none() {
			tracing::warn!("pid {} ignored SIGTERM; sending SIGKILL", self.pid);
			self.group.signal(Signal::SIGKILL);
			status = self.reap(STOP_GRACE).await;
			if status.is_none() {
				tracing::warn!("pid {} could not be reaped", self.pid);
			}
		}

		self.retire_reader().await;
		status
	}

	async fn reap(&mut self, limit: Duration) -> Option<ExitStatus> {
		match tokio::time::timeout(limit, self.child.wait()).await {
			Ok(Ok(status)) => Some(status),
			Ok(Err(e)) => {
				tracing::warn!("waiting for pid {} failed: {}", self.pid, e);
				None
			}
			Err(_) => None,
		}
	}

	async fn retire_reader(&mut self) {
		if tokio::time::timeout(READER_DRAIN, &mut self.reader).await.is_err() {
			self.reader.abort();
		}
	}
}

/// Publishes `entered` now and `on_drop` when dropped, so a cancelled
/// `start` or `stop` never leaves a transient state behind.
struct Transition<'a> {
	state: &'a watch::Sender<ServerState>,
	on_drop: ServerState,
}

impl<'a> Transition<'a> {
	fn enter(state: &'a watch::Sender<ServerState>, entered: ServerState, on_drop: ServerState) -> Self {
		state.send_replace(entered);
		Self { state, on_drop }
	}

	fn finish(mut self, state: ServerState) {
		self.on_drop = state;
	}
}

impl Drop for Transition<'_> {
	fn drop(&mut self) {
		self.state.send_replace(self.on_drop);
	}
}

fn resolve_port(configured: u16) -> Result<u16, Error> {
	if configured != 0 {
		return Ok(configured);
	}
	let listener = std::net::TcpListener::bind(("127.0.0.1", 0))?;
	Ok(listener.local_addr()?.port())
}

fn spawn_child(argv: &[OsString], dir: &Path) -> Result<Child, Error> {
	let (program, args) = argv
		.split_first()
		.ok_or_else(|| io::Error::other("empty command line"))?;

	let mut cmd = Command::new(program);
	cmd.args(args)
		.current_dir(dir)
		.stdin(Stdio::piped())
		.stdout(Stdio::piped())
		.stderr(Stdio::piped())
		// New process group so the whole tree can be signalled at once
		.process_group(0)
		.kill_on_drop(true);

	// The parent-death signal fires when the spawning thread exits, which for
	// a runtime worker is the lifetime of the runtime.
	#[cfg(target_os = "linux")]
	unsafe {
		cmd.pre_exec(|| nix::sys::prctl::set_pdeathsig(Signal::SIGKILL).map_err(io::Error::from));
	}

	cmd.spawn().map_err(|source| Error::Spawn {
		program: program.to_string_lossy().into_owned(),
		source,
	})
}
