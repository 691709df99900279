use std::fmt;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

/// Problems found while resolving [`Options`](crate::Options). No process
/// exists yet when one of these is returned.
#[derive(Debug)]
pub enum ConfigError {
	/// The domain root does not start with `dc=`.
	InvalidDomain(String),
	/// The seed LDIF file cannot be opened for reading.
	UnreadableSeedFile(PathBuf),
	/// The working directory for the child does not exist.
	MissingTmpdir(PathBuf),
	/// The jar directory cannot be listed.
	UnreadableJarDir(PathBuf),
	/// A startup timeout of zero seconds.
	InvalidTimeout,
	/// A TOML source could not be read or did not match the option types.
	Parse(String),
}

impl fmt::Display for ConfigError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			ConfigError::InvalidDomain(domain) => write!(
				f,
				"The domain component must start with 'dc='.  '{}' does not.",
				domain
			),
			ConfigError::UnreadableSeedFile(path) => {
				write!(f, "Cannot read specified LDIF file {}.", path.display())
			}
			ConfigError::MissingTmpdir(path) => {
				write!(f, "Tmpdir {} does not exist.", path.display())
			}
			ConfigError::UnreadableJarDir(path) => {
				write!(f, "Cannot list jar directory {}.", path.display())
			}
			ConfigError::InvalidTimeout => write!(f, "The startup timeout must be at least 1 second."),
			ConfigError::Parse(e) => write!(f, "invalid configuration: {}", e),
		}
	}
}

impl std::error::Error for ConfigError {}

/// Errors from resolving or starting a server.
#[derive(Debug)]
pub enum Error {
	Config(ConfigError),
	/// The child reported a fatal error, or exited, before becoming ready.
	StartupFailure { message: String },
	/// No readiness signal within the configured window.
	StartupTimeout { timeout: Duration },
	/// `stop()` was called before the child became ready.
	StartupCancelled,
	/// The child program could not be executed.
	Spawn { program: String, source: io::Error },
	Io(io::Error),
}

impl fmt::Display for Error {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Error::Config(e) => write!(f, "{}", e),
			Error::StartupFailure { message } => {
				write!(f, "LDAP server failed to start: {}", message)
			}
			Error::StartupTimeout { timeout } => write!(
				f,
				"LDAP server startup did not complete within {} seconds",
				timeout.as_secs()
			),
			Error::StartupCancelled => write!(f, "LDAP server startup was cancelled by stop()"),
			Error::Spawn { program, source } => {
				write!(f, "could not run {} (is it installed and on your PATH?): {}", program, source)
			}
			Error::Io(e) => write!(f, "io error: {}", e),
		}
	}
}

impl std::error::Error for Error {
	fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
		match self {
			Error::Config(e) => Some(e),
			Error::Spawn { source, .. } => Some(source),
			Error::Io(e) => Some(e),
			_ => None,
		}
	}
}

impl From<ConfigError> for Error {
	fn from(e: ConfigError) -> Self {
		Error::Config(e)
	}
}

impl From<io::Error> for Error {
	fn from(e: io::Error) -> Self {
		Error::Io(e)
	}
}
