use serde::Deserialize;
use std::ffi::OsString;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;

pub const DEFAULT_PORT: u16 = 3897;
pub const DEFAULT_DOMAIN: &str = "dc=example,dc=org";
pub const DEFAULT_TIMEOUT_SECS: u64 = 15;
pub const DEFAULT_JAVA: &str = "java";
pub const DEFAULT_MAIN_CLASS: &str = "net.detailedbalance.ladle.Main";
pub const JAR_DIR_ENV: &str = "NAKIME_JAR_DIR";

const DOMAIN_PREFIX: &str = "dc=";

const KNOWN_OPTIONS: &[&str] = &[
	"port",
	"domain",
	"ldif",
	"verbose",
	"quiet",
	"timeout",
	"more_args",
	"extra_search_entries",
	"tmpdir",
	"java_bin",
	"jar_dir",
	"main_class",
	"server_bin",
	"custom_schemas",
	"log_dir",
];

/// Caller-supplied settings, every field optional in TOML form.
///
/// Unknown keys in a TOML source are ignored with a warning so that newer
/// configuration files keep working with older builds.
#[derive(Debug, Clone, Deserialize)]
pub struct Options {
	#[serde(default = "default_port")]
	pub port: u16,
	#[serde(default = "default_domain")]
	pub domain: String,
	#[serde(default = "default_ldif")]
	pub ldif: PathBuf,
	#[serde(default)]
	pub verbose: bool,
	#[serde(default)]
	pub quiet: bool,
	/// Startup window in seconds.
	#[serde(default = "default_timeout")]
	pub timeout: u64,
	/// Appended verbatim after the standard flags.
	#[serde(default)]
	pub more_args: Vec<String>,
	/// Appended to the JVM classpath.
	#[serde(default)]
	pub extra_search_entries: Vec<PathBuf>,
	#[serde(default)]
	pub tmpdir: Option<PathBuf>,
	#[serde(default = "default_java")]
	pub java_bin: String,
	#[serde(default = "default_jar_dir")]
	pub jar_dir: Option<PathBuf>,
	#[serde(default = "default_main_class")]
	pub main_class: String,
	/// Run this executable directly instead of the JVM.
	#[serde(default)]
	pub server_bin: Option<PathBuf>,
	#[serde(default)]
	pub custom_schemas: Vec<String>,
	/// Directory for a transcript of the child's output.
	#[serde(default)]
	pub log_dir: Option<PathBuf>,
}

impl Default for Options {
	fn default() -> Self {
		Self {
			port: default_port(),
			domain: default_domain(),
			ldif: default_ldif(),
			verbose: false,
			quiet: false,
			timeout: default_timeout(),
			more_args: Vec::new(),
			extra_search_entries: Vec::new(),
			tmpdir: None,
			java_bin: default_java(),
			jar_dir: default_jar_dir(),
			main_class: default_main_class(),
			server_bin: None,
			custom_schemas: Vec::new(),
			log_dir: None,
		}
	}
}

fn default_port() -> u16 {
	DEFAULT_PORT
}
fn default_domain() -> String {
	DEFAULT_DOMAIN.to_string()
}
fn default_ldif() -> PathBuf {
	bundled_ldif()
}
fn default_timeout() -> u64 {
	DEFAULT_TIMEOUT_SECS
}
fn default_java() -> String {
	DEFAULT_JAVA.to_string()
}
fn default_jar_dir() -> Option<PathBuf> {
	std::env::var_os(JAR_DIR_ENV).map(PathBuf::from)
}
fn default_main_class() -> String {
	DEFAULT_MAIN_CLASS.to_string()
}

/// The sample data set shipped with the crate: `dc=example,dc=org`, one
/// `ou=people` group and 26 people.
pub fn bundled_ldif() -> PathBuf {
	PathBuf::from(concat!(env!("CARGO_MANIFEST_DIR"), "/data/default.ldif"))
}

impl Options {
	pub fn from_table(table: toml::Table) -> Result<Self, ConfigError> {
		for key in table.keys() {
			if !KNOWN_OPTIONS.contains(&key.as_str()) {
				tracing::warn!("ignoring unknown option '{}'", key);
			}
		}
		toml::Value::Table(table)
			.try_into()
			.map_err(|e: toml::de::Error| ConfigError::Parse(e.to_string()))
	}

	pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
		let table: toml::Table =
			toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
		Self::from_table(table)
	}

	pub fn load(path: &Path) -> Result<Self, ConfigError> {
		let content = std::fs::read_to_string(path)
			.map_err(|e| ConfigError::Parse(format!("failed to read {}: {}", path.display(), e)))?;
		Self::from_toml_str(&content)
	}

	/// Validate and freeze into a [`StartupDescriptor`]. Reads the file
	/// system but never starts anything.
	pub fn resolve(self) -> Result<StartupDescriptor, ConfigError> {
		StartupDescriptor::resolve(self)
	}
}

#[derive(Debug, Clone)]
pub enum Launcher {
	Jvm {
		java: String,
		classpath: OsString,
		main_class: String,
	},
	Binary(PathBuf),
}

/// Resolved, immutable parameters for one child invocation.
#[derive(Debug, Clone)]
pub struct StartupDescriptor {
	port: u16,
	domain: String,
	ldif: PathBuf,
	verbose: bool,
	quiet: bool,
	timeout: Duration,
	more_args: Vec<String>,
	extra_search_entries: Vec<PathBuf>,
	tmpdir: PathBuf,
	custom_schemas: Vec<String>,
	launcher: Launcher,
	log_dir: Option<PathBuf>,
}

impl StartupDescriptor {
	pub fn resolve(options: Options) -> Result<Self, ConfigError> {
		if !options.domain.starts_with(DOMAIN_PREFIX) {
			return Err(ConfigError::InvalidDomain(options.domain));
		}

		if !is_readable_file(&options.ldif) {
			return Err(ConfigError::UnreadableSeedFile(options.ldif));
		}

		let tmpdir = options.tmpdir.unwrap_or_else(std::env::temp_dir);
		if !tmpdir.is_dir() {
			return Err(ConfigError::MissingTmpdir(tmpdir));
		}

		if options.timeout == 0 {
			return Err(ConfigError::InvalidTimeout);
		}

		let launcher = match options.server_bin {
			Some(bin) => Launcher::Binary(bin),
			None => {
				let mut entries = match &options.jar_dir {
					Some(dir) => list_jars(dir)?,
					None => Vec::new(),
				};
				entries.extend(options.extra_search_entries.iter().cloned());
				let classpath = std::env::join_paths(&entries)
					.map_err(|e| ConfigError::Parse(format!("invalid classpath entry: {}", e)))?;
				Launcher::Jvm {
					java: options.java_bin,
					classpath,
					main_class: options.main_class,
				}
			}
		};

		Ok(Self {
			port: options.port,
			domain: options.domain,
			ldif: options.ldif,
			verbose: options.verbose,
			quiet: options.quiet,
			timeout: Duration::from_secs(options.timeout),
			more_args: options.more_args,
			extra_search_entries: options.extra_search_entries,
			tmpdir,
			custom_schemas: options.custom_schemas,
			launcher,
			log_dir: options.log_dir,
		})
	}

	/// Configured port; 0 means a free one is picked at each start.
	pub fn port(&self) -> u16 {
		self.port
	}

	pub fn domain(&self) -> &str {
		&self.domain
	}

	pub fn ldif(&self) -> &Path {
		&self.ldif
	}

	pub fn is_verbose(&self) -> bool {
		self.verbose
	}

	pub fn is_quiet(&self) -> bool {
		self.quiet
	}

	pub fn timeout(&self) -> Duration {
		self.timeout
	}

	pub fn more_args(&self) -> &[String] {
		&self.more_args
	}

	pub fn extra_search_entries(&self) -> &[PathBuf] {
		&self.extra_search_entries
	}

	pub fn tmpdir(&self) -> &Path {
		&self.tmpdir
	}

	pub fn launcher(&self) -> &Launcher {
		&self.launcher
	}

	pub fn log_dir(&self) -> Option<&Path> {
		self.log_dir.as_deref()
	}

	/// Full argv for the child, program first.
	pub fn command_line(&self, port: u16) -> Vec<OsString> {
		let mut argv: Vec<OsString> = Vec::new();
		match &self.launcher {
			Launcher::Jvm { java, classpath, main_class } => {
				argv.push(java.into());
				argv.push("-cp".into());
				argv.push(classpath.clone());
				argv.push(main_class.into());
			}
			Launcher::Binary(bin) => argv.push(bin.into()),
		}

		argv.push("--port".into());
		argv.push(port.to_string().into());
		argv.push("--domain".into());
		argv.push((&self.domain).into());
		argv.push("--ldif".into());
		argv.push(self.ldif.clone().into());
		argv.push("--tmpdir".into());
		argv.push(self.tmpdir.clone().into());
		if !self.custom_schemas.is_empty() {
			argv.push("--custom-schemas".into());
			argv.push(self.custom_schemas.join(",").into());
		}
		if self.verbose {
			argv.push("--verbose".into());
		}
		argv.extend(self.more_args.iter().map(OsString::from));
		argv
	}

	/// `command_line` rendered for logs.
	pub fn display_command(&self, port: u16) -> String {
		self.command_line(port)
			.iter()
			.map(|a| a.to_string_lossy().into_owned())
			.collect::<Vec<_>>()
			.join(" ")
	}
}

fn is_readable_file(path: &Path) -> bool {
	path.is_file() && File::open(path).is_ok()
}

fn list_jars(dir: &Path) -> Result<Vec<PathBuf>, ConfigError> {
	let entries =
		std::fs::read_dir(dir).map_err(|_| ConfigError::UnreadableJarDir(dir.to_path_buf()))?;
	let mut jars: Vec<PathBuf> = entries
		.flatten()
		.map(|e| e.path())
		.filter(|p| p.extension().and_then(|e| e.to_str()) == Some("jar"))
		.collect();
	jars.sort();
	Ok(jars)
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::{AtomicU32, Ordering};

	static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

	fn temp_dir(name: &str) -> PathBuf {
		let n = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
		let dir = std::env::temp_dir().join(format!("nakime-config-{}-{}-{}", std::process::id(), n, name));
		let _ = std::fs::create_dir_all(&dir);
		dir
	}

	fn options() -> Options {
		Options {
			jar_dir: None,
			..Options::default()
		}
	}

	#[test]
	fn defaults() {
		let d = options().resolve().unwrap();
		assert_eq!(d.port(), 3897);
		assert_eq!(d.domain(), "dc=example,dc=org");
		assert_eq!(d.timeout(), Duration::from_secs(15));
		assert!(!d.is_verbose());
		assert!(!d.is_quiet());
		assert!(d.ldif().ends_with("data/default.ldif"));
		assert!(d.more_args().is_empty());
		assert!(d.extra_search_entries().is_empty());
	}

	#[test]
	fn rejects_domain_without_prefix() {
		let err = Options { domain: "foo".into(), ..options() }.resolve().unwrap_err();
		assert!(matches!(err, ConfigError::InvalidDomain(ref d) if d == "foo"));
	}

	#[test]
	fn rejects_missing_seed_file() {
		let err = Options { ldif: "foo/bar.ldif".into(), ..options() }.resolve().unwrap_err();
		assert_eq!(err.to_string(), "Cannot read specified LDIF file foo/bar.ldif.");
	}

	#[test]
	fn rejects_directory_as_seed_file() {
		let dir = temp_dir("seed-dir");
		let err = Options { ldif: dir.clone(), ..options() }.resolve().unwrap_err();
		assert!(matches!(err, ConfigError::UnreadableSeedFile(_)));
		let _ = std::fs::remove_dir_all(&dir);
	}

	#[test]
	fn rejects_missing_tmpdir_and_zero_timeout() {
		let err = Options { tmpdir: Some("/nonexistent/nakime".into()), ..options() }
			.resolve()
			.unwrap_err();
		assert!(matches!(err, ConfigError::MissingTmpdir(_)));

		let err = Options { timeout: 0, ..options() }.resolve().unwrap_err();
		assert!(matches!(err, ConfigError::InvalidTimeout));
	}

	#[test]
	fn jvm_command_line() {
		let jars = temp_dir("jars");
		std::fs::write(jars.join("b.jar"), "").unwrap();
		std::fs::write(jars.join("a.jar"), "").unwrap();
		std::fs::write(jars.join("README"), "").unwrap();

		let d = Options {
			jar_dir: Some(jars.clone()),
			extra_search_entries: vec!["/opt/schemas".into()],
			custom_schemas: vec!["com.example.A".into(), "com.example.B".into()],
			verbose: true,
			more_args: vec!["--fail".into(), "hang".into()],
			tmpdir: Some(jars.clone()),
			..options()
		}
		.resolve()
		.unwrap();

		let argv: Vec<String> = d
			.command_line(4200)
			.into_iter()
			.map(|a| a.to_string_lossy().into_owned())
			.collect();
		let classpath = format!(
			"{}:{}:/opt/schemas",
			jars.join("a.jar").display(),
			jars.join("b.jar").display()
		);
		assert_eq!(&argv[..4], &["java".to_string(), "-cp".into(), classpath, DEFAULT_MAIN_CLASS.into()]);
		assert_eq!(&argv[4..6], &["--port".to_string(), "4200".into()]);
		assert_eq!(&argv[6..8], &["--domain".to_string(), "dc=example,dc=org".into()]);
		assert!(argv.contains(&"--custom-schemas".to_string()));
		assert!(argv.contains(&"com.example.A,com.example.B".to_string()));
		assert_eq!(&argv[argv.len() - 3..], &["--verbose".to_string(), "--fail".into(), "hang".into()]);

		let _ = std::fs::remove_dir_all(&jars);
	}

	#[test]
	fn binary_command_line() {
		let d = Options { server_bin: Some("/usr/local/bin/dirsrv".into()), ..options() }
			.resolve()
			.unwrap();
		let argv = d.command_line(1389);
		assert_eq!(argv[0], OsString::from("/usr/local/bin/dirsrv"));
		assert_eq!(argv[1], OsString::from("--port"));
		assert_eq!(argv[2], OsString::from("1389"));
		assert!(d.display_command(1389).starts_with("/usr/local/bin/dirsrv --port 1389 --domain"));
	}

	#[test]
	fn toml_defaults_and_unknown_keys() {
		let o = Options::from_toml_str(
			r#"
			port = 4200
			domain = "dc=northwestern,dc=edu"
			timeout = 27
			more_args = ["--fail", "hang"]
			colour = "blue"
			"#,
		)
		.unwrap();
		assert_eq!(o.port, 4200);
		assert_eq!(o.domain, "dc=northwestern,dc=edu");
		assert_eq!(o.timeout, 27);
		assert_eq!(o.more_args, vec!["--fail".to_string(), "hang".into()]);
		assert!(!o.verbose);
		assert_eq!(o.main_class, DEFAULT_MAIN_CLASS);
		assert_eq!(o.ldif, bundled_ldif());
	}

	#[test]
	fn toml_type_mismatch() {
		let err = Options::from_toml_str("port = \"high\"").unwrap_err();
		assert!(matches!(err, ConfigError::Parse(_)));
	}
}
