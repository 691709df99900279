use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use nakime::{guard, ConfigError, Options, Server, StartupDescriptor};
use owo_colors::OwoColorize;
use serde::Serialize;

#[derive(Debug, Parser)]
#[command(name = "nakime", version, about = "Throwaway LDAP server for tests")]
struct Cli {
	#[command(subcommand)]
	command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
	/// Start a server and keep it up until Ctrl-C
	Run {
		#[command(flatten)]
		server: ServerArgs,
		/// Print connection details as one JSON line
		#[arg(long)]
		json: bool,
	},
	/// Validate the options and print the server command line
	Check {
		#[command(flatten)]
		server: ServerArgs,
	},
}

#[derive(Debug, Args)]
struct ServerArgs {
	/// TOML file with server options
	#[arg(short, long)]
	config: Option<PathBuf>,
	/// Port to listen on (0 picks a free one)
	#[arg(short, long)]
	port: Option<u16>,
	/// Domain root, must start with dc=
	#[arg(long)]
	domain: Option<String>,
	/// Seed LDIF file
	#[arg(long)]
	ldif: Option<PathBuf>,
	/// Startup timeout in seconds
	#[arg(long)]
	timeout: Option<u64>,
	/// Run this executable instead of the JVM
	#[arg(long)]
	server_bin: Option<PathBuf>,
	/// Directory holding the server jars
	#[arg(long)]
	jar_dir: Option<PathBuf>,
	/// Working directory for the server
	#[arg(long)]
	tmpdir: Option<PathBuf>,
	/// Append a transcript of server output here
	#[arg(long)]
	log_dir: Option<PathBuf>,
	#[arg(short, long)]
	verbose: bool,
	#[arg(short, long)]
	quiet: bool,
	/// Extra arguments for the server, after `--`
	#[arg(last = true)]
	more_args: Vec<String>,
}

impl ServerArgs {
	fn options(&self) -> Result<Options, ConfigError> {
		let mut options = match &self.config {
			Some(path) => Options::load(path)?,
			None => Options::default(),
		};
		if let Some(port) = self.port {
			options.port = port;
		}
		if let Some(ref domain) = self.domain {
			options.domain = domain.clone();
		}
		if let Some(ref ldif) = self.ldif {
			options.ldif = ldif.clone();
		}
		if let Some(timeout) = self.timeout {
			options.timeout = timeout;
		}
		if self.server_bin.is_some() {
			options.server_bin = self.server_bin.clone();
		}
		if self.jar_dir.is_some() {
			options.jar_dir = self.jar_dir.clone();
		}
		if self.tmpdir.is_some() {
			options.tmpdir = self.tmpdir.clone();
		}
		if self.log_dir.is_some() {
			options.log_dir = self.log_dir.clone();
		}
		options.verbose |= self.verbose;
		options.quiet |= self.quiet;
		if !self.more_args.is_empty() {
			options.more_args = self.more_args.clone();
		}
		Ok(options)
	}

	fn descriptor(&self) -> Result<StartupDescriptor, ConfigError> {
		self.options().and_then(Options::resolve)
	}

	fn log_level(&self) -> tracing::Level {
		if self.verbose {
			tracing::Level::DEBUG
		} else if self.quiet {
			tracing::Level::WARN
		} else {
			tracing::Level::INFO
		}
	}
}

#[derive(Debug, Serialize)]
struct Connection {
	url: String,
	port: u16,
	base: String,
	pid: Option<u32>,
}

#[tokio::main]
async fn main() {
	let cli = Cli::parse();

	let level = match &cli.command {
		Command::Run { server, .. } | Command::Check { server } => server.log_level(),
	};
	tracing_subscriber::fmt()
		.with_writer(std::io::stderr)
		.with_max_level(level)
		.init();

	let code = match cli.command {
		Command::Run { server, json } => cmd_run(&server, json).await,
		Command::Check { server } => cmd_check(&server),
	};
	std::process::exit(code);
}

fn report_error(e: &dyn std::fmt::Display) {
	eprintln!("{}: {}", "error".red().bold(), e);
}

async fn cmd_run(args: &ServerArgs, json: bool) -> i32 {
	let descriptor = match args.descriptor() {
		Ok(d) => d,
		Err(e) => {
			report_error(&e);
			return 2;
		}
	};

	let server = Server::new(descriptor);

	// Until start() returns, an interrupt kills the half-started group
	let interrupt = guard::install_signal_handler();
	let started = server.start().await;
	interrupt.abort();
	if let Err(e) = started {
		report_error(&e);
		return 1;
	}

	let connection = Connection {
		url: format!("ldap://localhost:{}", server.port()),
		port: server.port(),
		base: server.descriptor().domain().to_string(),
		pid: server.pid(),
	};
	if json {
		match serde_json::to_string(&connection) {
			Ok(line) => println!("{}", line),
			Err(e) => report_error(&e),
		}
	} else {
		print_connection(&connection);
	}

	shutdown_signal().await;
	server.stop().await;
	0
}

fn cmd_check(args: &ServerArgs) -> i32 {
	match args.descriptor() {
		Ok(d) => {
			eprintln!("{} {}", "ok".green().bold(), d.domain());
			eprintln!("  {:<8} {}", "ldif".dimmed(), d.ldif().display());
			eprintln!("  {:<8} {}s", "timeout".dimmed(), d.timeout().as_secs());
			println!("{}", d.display_command(d.port()));
			0
		}
		Err(e) => {
			report_error(&e);
			2
		}
	}
}

fn print_connection(connection: &Connection) {
	eprintln!("{} {}", "ready".green().bold(), connection.url.bold());
	eprintln!("  {:<5} {}", "base".dimmed(), connection.base);
	if let Some(pid) = connection.pid {
		eprintln!("  {:<5} {}", "pid".dimmed(), pid);
	}
	eprintln!("press Ctrl-C to stop");
}

async fn shutdown_signal() {
	use tokio::signal::unix::{signal, SignalKind};

	match signal(SignalKind::terminate()) {
		Ok(mut terminate) => {
			tokio::select! {
				_ = tokio::signal::ctrl_c() => {},
				_ = terminate.recv() => {},
			}
		}
		Err(e) => {
			tracing::warn!("cannot listen for SIGTERM: {}", e);
			let _ = tokio::signal::ctrl_c().await;
		}
	}
	tracing::info!("shutting down");
}
