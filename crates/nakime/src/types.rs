use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
	Idle,
	Starting,
	Running,
	Stopping,
}

impl ServerState {
	pub fn is_running(&self) -> bool {
		matches!(self, ServerState::Running)
	}
}

impl fmt::Display for ServerState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let name = match self {
			ServerState::Idle => "idle",
			ServerState::Starting => "starting",
			ServerState::Running => "running",
			ServerState::Stopping => "stopping",
		};
		f.write_str(name)
	}
}

/// Outcome published by the readiness reader, at most once per child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadinessEvent {
	Ready,
	FatalError(String),
	/// Both output streams closed before either sentinel was seen.
	StreamClosed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
	Stdout,
	Stderr,
}

impl Stream {
	pub fn as_str(&self) -> &'static str {
		match self {
			Stream::Stdout => "stdout",
			Stream::Stderr => "stderr",
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildLine {
	pub stream: Stream,
	pub text: String,
}
