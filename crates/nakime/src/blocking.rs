//! Synchronous wrapper for plain `#[test]` functions.
//!
//! Owns a single-worker runtime. The worker keeps draining the child's output
//! between calls, so the child never stalls on a full pipe while the test
//! talks to it.

use std::process::ExitStatus;

use crate::config::StartupDescriptor;
use crate::error::Error;
use crate::output::{Console, OutputCapture};
use crate::types::ServerState;

pub struct Server {
	inner: crate::Server,
	runtime: tokio::runtime::Runtime,
}

impl Server {
	pub fn new(descriptor: StartupDescriptor) -> Result<Self, Error> {
		Self::with_console(descriptor, Console::stderr())
	}

	pub fn with_console(descriptor: StartupDescriptor, console: Console) -> Result<Self, Error> {
		let runtime = tokio::runtime::Builder::new_multi_thread()
			.worker_threads(1)
			.thread_name("nakime")
			.enable_all()
			.build()?;
		Ok(Self {
			inner: crate::Server::with_console(descriptor, console),
			runtime,
		})
	}

	/// Blocks until the child is ready; see [`crate::Server::start`].
	pub fn start(&self) -> Result<&Self, Error> {
		self.runtime.block_on(self.inner.start())?;
		Ok(self)
	}

	pub fn stop(&self) {
		self.runtime.block_on(self.inner.stop())
	}

	pub fn port(&self) -> u16 {
		self.inner.port()
	}

	pub fn pid(&self) -> Option<u32> {
		self.inner.pid()
	}

	pub fn state(&self) -> ServerState {
		self.inner.state()
	}

	pub fn descriptor(&self) -> &StartupDescriptor {
		self.inner.descriptor()
	}

	pub fn output(&self) -> &OutputCapture {
		self.inner.output()
	}

	pub fn output_text(&self) -> String {
		self.runtime.block_on(self.inner.output().text())
	}

	pub fn last_exit(&self) -> Option<ExitStatus> {
		self.runtime.block_on(self.inner.last_exit())
	}
}

impl Drop for Server {
	fn drop(&mut self) {
		// block_on panics inside another runtime; the inner drop still kills
		// the process group in that case.
		if tokio::runtime::Handle::try_current().is_err() {
			self.runtime.block_on(self.inner.stop());
		}
	}
}
