//! Best-effort protection against children outliving the host.
//!
//! Every spawned child leads its own process group. A [`ProcessGroup`] owns
//! that group: dropping it kills every member, and a process-wide registry
//! lets a signal handler do the same for all groups still alive when the
//! host is interrupted.

use nix::errno::Errno;
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid;
use std::collections::BTreeSet;
use std::sync::{Mutex, OnceLock};

fn registry() -> &'static Mutex<BTreeSet<i32>> {
	static LIVE: OnceLock<Mutex<BTreeSet<i32>>> = OnceLock::new();
	LIVE.get_or_init(|| Mutex::new(BTreeSet::new()))
}

fn register(pgid: i32) {
	registry().lock().unwrap_or_else(|e| e.into_inner()).insert(pgid);
}

fn release(pgid: i32) {
	registry().lock().unwrap_or_else(|e| e.into_inner()).remove(&pgid);
}

/// Process group ids currently owned by some [`ProcessGroup`].
pub fn live_groups() -> Vec<u32> {
	registry()
		.lock()
		.unwrap_or_else(|e| e.into_inner())
		.iter()
		.map(|&pgid| pgid as u32)
		.collect()
}

/// SIGKILL every registered group. Returns how many were signalled.
pub fn kill_all() -> usize {
	let groups: Vec<i32> = registry()
		.lock()
		.unwrap_or_else(|e| e.into_inner())
		.iter()
		.copied()
		.collect();
	groups
		.into_iter()
		.filter(|&pgid| killpg(Pid::from_raw(pgid), Signal::SIGKILL).is_ok())
		.count()
}

/// Kill all registered groups and exit when the host receives Ctrl-C or
/// SIGTERM. Call from inside a tokio runtime.
pub fn install_signal_handler() -> tokio::task::JoinHandle<()> {
	tokio::spawn(async {
		use tokio::signal::unix::{signal, SignalKind};

		let mut terminate = match signal(SignalKind::terminate()) {
			Ok(s) => s,
			Err(e) => {
				tracing::warn!("cannot listen for SIGTERM: {}", e);
				return;
			}
		};

		tokio::select! {
			_ = tokio::signal::ctrl_c() => {},
			_ = terminate.recv() => {},
		}

		let killed = kill_all();
		tracing::info!("interrupted; killed {} process group(s)", killed);
		std::process::exit(130);
	})
}

/// Whether `pid` names a live, non-zombie process.
pub fn process_alive(pid: u32) -> bool {
	if kill(Pid::from_raw(pid as i32), None::<Signal>).is_err() {
		return false;
	}
	!is_zombie(pid)
}

#[cfg(target_os = "linux")]
fn is_zombie(pid: u32) -> bool {
	// Field 3 of /proc/<pid>/stat, after the parenthesised command name.
	std::fs::read_to_string(format!("/proc/{}/stat", pid))
		.ok()
		.and_then(|stat| {
			let rest = &stat[stat.rfind(')')? + 1..];
			rest.split_whitespace().next().map(|state| state == "Z")
		})
		.unwrap_or(false)
}

#[cfg(not(target_os = "linux"))]
fn is_zombie(_pid: u32) -> bool {
	false
}

/// Ownership of one child's process group.
#[derive(Debug)]
pub struct ProcessGroup {
	pgid: Pid,
}

impl ProcessGroup {
	/// Take ownership of the group led by `leader`, which must have been
	/// spawned with `process_group(0)`.
	pub(crate) fn adopt(leader: u32) -> Self {
		let pgid = leader as i32;
		register(pgid);
		Self { pgid: Pid::from_raw(pgid) }
	}

	pub fn id(&self) -> u32 {
		self.pgid.as_raw() as u32
	}

	/// Signal every member. `false` once the group is empty.
	pub fn signal(&self, signal: Signal) -> bool {
		match killpg(self.pgid, signal) {
			Ok(()) => true,
			Err(Errno::ESRCH) => false,
			Err(e) => {
				tracing::warn!("{} to process group {} failed: {}", signal, self.pgid, e);
				false
			}
		}
	}
}

impl Drop for ProcessGroup {
	fn drop(&mut self) {
		if self.signal(Signal::SIGKILL) {
			tracing::debug!("killed leftover members of process group {}", self.pgid);
		}
		release(self.pgid.as_raw());
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::process::{Command, Stdio};
	use std::os::unix::process::CommandExt;

	#[test]
	fn drop_kills_the_group() {
		let mut child = Command::new("sh")
			.args(["-c", "sleep 60 & wait"])
			.stdout(Stdio::null())
			.process_group(0)
			.spawn()
			.unwrap();
		let pid = child.id();

		let group = ProcessGroup::adopt(pid);
		assert_eq!(group.id(), pid);
		assert!(live_groups().contains(&pid));
		assert!(process_alive(pid));

		drop(group);
		let _ = child.wait();
		assert!(!process_alive(pid));
		assert!(!live_groups().contains(&pid));
	}

	#[test]
	fn signal_to_empty_group_is_false() {
		let mut child = Command::new("true").process_group(0).spawn().unwrap();
		let pid = child.id();
		let _ = child.wait();
		let group = ProcessGroup::adopt(pid);
		assert!(!group.signal(Signal::SIGTERM));
		assert!(!process_alive(pid));
	}
}
