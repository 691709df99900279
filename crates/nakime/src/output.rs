use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::broadcast;
use tokio::sync::Mutex;

use crate::logs;
use crate::types::{ChildLine, Stream};

const RING_BUFFER_SIZE: usize = 64 * 1024;
pub const DEFAULT_MAX_TRANSCRIPT_SIZE: u64 = 10 * 1024 * 1024;

/// Everything the child printed: a bounded in-memory tail, live subscribers,
/// and an optional transcript file that rotates when it grows too large.
#[derive(Clone)]
pub struct OutputCapture {
	ring: Arc<Mutex<VecDeque<u8>>>,
	log_writer: Arc<Mutex<Option<LogWriter>>>,
	sender: broadcast::Sender<ChildLine>,
}

struct LogWriter {
	dir: PathBuf,
	stem: String,
	path: PathBuf,
	file: Option<File>,
	size: u64,
	limit: u64,
}

impl OutputCapture {
	/// `transcript` is `(log_dir, stem)`; pass `None` to keep output in
	/// memory only.
	pub fn new(transcript: Option<(&Path, &str)>, max_log_size: u64) -> Self {
		let log_writer = transcript.map(|(log_dir, stem)| LogWriter::open(log_dir, stem, max_log_size));
		let (sender, _) = broadcast::channel(256);

		Self {
			ring: Arc::new(Mutex::new(VecDeque::with_capacity(RING_BUFFER_SIZE))),
			log_writer: Arc::new(Mutex::new(log_writer)),
			sender,
		}
	}

	pub async fn write_line(&self, stream: Stream, line: &str) {
		let mut data = Vec::with_capacity(line.len() + 1);
		data.extend_from_slice(line.as_bytes());
		data.push(b'\n');

		{
			let mut ring = self.ring.lock().await;
			for &byte in &data {
				if ring.len() >= RING_BUFFER_SIZE {
					ring.pop_front();
				}
				ring.push_back(byte);
			}
		}

		{
			let mut writer = self.log_writer.lock().await;
			if let Some(writer) = writer.as_mut() {
				writer.write(&data);
			}
		}

		let _ = self.sender.send(ChildLine {
			stream,
			text: line.to_string(),
		});
	}

	pub async fn snapshot(&self) -> Vec<u8> {
		let ring = self.ring.lock().await;
		ring.iter().copied().collect()
	}

	pub async fn text(&self) -> String {
		String::from_utf8_lossy(&self.snapshot().await).into_owned()
	}

	pub fn subscribe(&self) -> broadcast::Receiver<ChildLine> {
		self.sender.subscribe()
	}

	/// Send later lines to `<log_dir>/<stem>.log` instead of any earlier
	/// transcript.
	pub async fn open_transcript(&self, log_dir: &Path, stem: &str, max_log_size: u64) {
		let writer = LogWriter::open(log_dir, stem, max_log_size);
		*self.log_writer.lock().await = Some(writer);
	}

	pub async fn transcript_path(&self) -> Option<PathBuf> {
		let writer = self.log_writer.lock().await;
		writer.as_ref().map(|w| w.path.clone())
	}
}

impl LogWriter {
	fn open(dir: &Path, stem: &str, limit: u64) -> Self {
		let path = dir.join(logs::current_log_name(stem));
		let (file, size) = match fs::create_dir_all(dir).and_then(|_| append_to(&path)) {
			Ok(file) => {
				let size = file.metadata().map(|m| m.len()).unwrap_or(0);
				(Some(file), size)
			}
			Err(e) => {
				tracing::warn!("cannot open transcript {}: {}; output kept in memory only", path.display(), e);
				(None, 0)
			}
		};

		Self {
			dir: dir.to_path_buf(),
			stem: stem.to_string(),
			path,
			file,
			size,
			limit,
		}
	}

	fn write(&mut self, data: &[u8]) {
		let Some(file) = self.file.as_mut() else {
			return;
		};
		if let Err(e) = file.write_all(data) {
			tracing::debug!("transcript write to {} failed: {}", self.path.display(), e);
			return;
		}
		self.size += data.len() as u64;
		if self.limit > 0 && self.size >= self.limit {
			self.rotate();
		}
	}

	fn rotate(&mut self) {
		self.file = None;
		let target = logs::rotated_log_path(&self.dir, &self.stem, logs::now_secs());
		if let Err(e) = fs::rename(&self.path, &target) {
			tracing::warn!("cannot rotate transcript {}: {}", self.path.display(), e);
		}
		self.file = append_to(&self.path).ok();
		self.size = 0;
	}
}

fn append_to(path: &Path) -> io::Result<File> {
	OpenOptions::new().create(true).append(true).open(path)
}

/// Where the fixture talks to the person running the tests: stderr unless
/// replaced.
#[derive(Clone)]
pub struct Console {
	inner: Arc<StdMutex<Box<dyn Write + Send>>>,
	buffer: Option<Arc<StdMutex<Vec<u8>>>>,
}

impl Console {
	pub fn stderr() -> Self {
		Self::new(std::io::stderr())
	}

	pub fn new(writer: impl Write + Send + 'static) -> Self {
		Self {
			inner: Arc::new(StdMutex::new(Box::new(writer))),
			buffer: None,
		}
	}

	/// An in-memory console whose text can be read back with
	/// [`Console::contents`].
	pub fn buffer() -> Self {
		let buffer = Arc::new(StdMutex::new(Vec::new()));
		Self {
			inner: Arc::new(StdMutex::new(Box::new(SharedBuffer(Arc::clone(&buffer))))),
			buffer: Some(buffer),
		}
	}

	pub fn line(&self, text: &str) {
		let mut writer = self.inner.lock().unwrap_or_else(|e| e.into_inner());
		let _ = writeln!(writer, "{}", text);
		let _ = writer.flush();
	}

	pub fn contents(&self) -> String {
		match &self.buffer {
			Some(buffer) => {
				let buffer = buffer.lock().unwrap_or_else(|e| e.into_inner());
				String::from_utf8_lossy(&buffer).into_owned()
			}
			None => String::new(),
		}
	}
}

impl Default for Console {
	fn default() -> Self {
		Self::stderr()
	}
}

struct SharedBuffer(Arc<StdMutex<Vec<u8>>>);

impl Write for SharedBuffer {
	fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
		let mut inner = self.0.lock().unwrap_or_else(|e| e.into_inner());
		inner.extend_from_slice(buf);
		Ok(buf.len())
	}

	fn flush(&mut self) -> std::io::Result<()> {
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::{AtomicU32, Ordering};

	static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

	fn temp_dir(name: &str) -> PathBuf {
		let n = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
		std::env::temp_dir().join(format!("nakime-output-{}-{}-{}", std::process::id(), n, name))
	}

	#[tokio::test]
	async fn ring_keeps_the_tail() {
		let capture = OutputCapture::new(None, 0);
		let line = "x".repeat(1023);
		for _ in 0..100 {
			capture.write_line(Stream::Stdout, &line).await;
		}
		capture.write_line(Stream::Stderr, "last").await;
		let snapshot = capture.snapshot().await;
		assert_eq!(snapshot.len(), RING_BUFFER_SIZE);
		assert!(capture.text().await.ends_with("xx\nlast\n"));
	}

	#[tokio::test]
	async fn subscribers_see_lines() {
		let capture = OutputCapture::new(None, 0);
		let mut rx = capture.subscribe();
		capture.write_line(Stream::Stderr, "hello").await;
		let line = rx.recv().await.unwrap();
		assert_eq!(line, ChildLine { stream: Stream::Stderr, text: "hello".into() });
	}

	#[tokio::test]
	async fn transcript_rotates() {
		let dir = temp_dir("rotate");
		let capture = OutputCapture::new(Some((dir.as_path(), "nakime-3897")), 16);
		let first = capture.transcript_path().await.unwrap();
		assert!(first.starts_with(&dir));

		capture.write_line(Stream::Stdout, "0123456789abcdef").await;
		capture.write_line(Stream::Stdout, "after rotation").await;

		let files: Vec<_> = fs::read_dir(&dir).unwrap().flatten().collect();
		assert_eq!(files.len(), 2);
		let current = fs::read_to_string(capture.transcript_path().await.unwrap()).unwrap();
		assert_eq!(current, "after rotation\n");

		let _ = fs::remove_dir_all(&dir);
	}

	#[tokio::test]
	async fn rotations_within_a_minute_keep_every_file() {
		let dir = temp_dir("rotate-often");
		let capture = OutputCapture::new(Some((dir.as_path(), "nakime-1389")), 4);
		for line in ["first", "second", "third"] {
			capture.write_line(Stream::Stdout, line).await;
		}

		let mut kept: Vec<String> = fs::read_dir(&dir)
			.unwrap()
			.flatten()
			.filter(|e| e.file_name() != "nakime-1389.log")
			.map(|e| fs::read_to_string(e.path()).unwrap())
			.collect();
		kept.sort();
		assert_eq!(kept, vec!["first\n", "second\n", "third\n"]);

		let _ = fs::remove_dir_all(&dir);
	}

	#[tokio::test]
	async fn open_transcript_switches_files() {
		let dir = temp_dir("switch");
		let capture = OutputCapture::new(None, 0);
		capture.write_line(Stream::Stdout, "memory only").await;
		assert!(capture.transcript_path().await.is_none());

		capture.open_transcript(&dir, "nakime-40001", 0).await;
		capture.write_line(Stream::Stdout, "on disk").await;
		let path = capture.transcript_path().await.unwrap();
		assert_eq!(path, dir.join("nakime-40001.log"));
		assert_eq!(fs::read_to_string(&path).unwrap(), "on disk\n");

		let _ = fs::remove_dir_all(&dir);
	}

	#[test]
	fn console_buffer_collects_lines() {
		let console = Console::buffer();
		console.line("one");
		console.clone().line("two");
		assert_eq!(console.contents(), "one\ntwo\n");
	}
}
