//! Stand-in for the real directory server. Speaks the same line protocol:
//! binds `--port`, prints `STARTED`, exits on `STOP`. Used by the test suite
//! and for trying the CLI on machines without a JVM.
//!
//! `--fail <mode>` simulates misbehaviour:
//!   before_start  print a FATAL line and exit
//!   hang          never become ready
//!   silent        exit without printing anything
//!   ignore_stop   become ready, then ignore STOP and stdin EOF
//! `--spawn-child` starts a long-lived grandchild and prints its pid.

use std::io::{self, BufRead};
use std::net::TcpListener;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::Duration;

struct StubArgs {
	port: u16,
	domain: String,
	ldif: String,
	fail: Option<String>,
	spawn_child: bool,
	verbose: bool,
}

fn parse(args: &[String]) -> Result<StubArgs, String> {
	let mut parsed = StubArgs {
		port: 3897,
		domain: "dc=example,dc=org".to_string(),
		ldif: String::new(),
		fail: None,
		spawn_child: false,
		verbose: false,
	};

	let mut iter = args.iter();
	while let Some(arg) = iter.next() {
		let mut value = || iter.next().cloned().ok_or_else(|| format!("{} needs a value", arg));
		match arg.as_str() {
			"--port" => parsed.port = value()?.parse().map_err(|e| format!("bad port: {}", e))?,
			"--domain" => parsed.domain = value()?,
			"--ldif" => parsed.ldif = value()?,
			"--tmpdir" | "--custom-schemas" => {
				value()?;
			}
			"--fail" => parsed.fail = Some(value()?),
			"--spawn-child" => parsed.spawn_child = true,
			"--verbose" => parsed.verbose = true,
			other => return Err(format!("unknown argument {}", other)),
		}
	}
	Ok(parsed)
}

fn hang() -> ! {
	loop {
		std::thread::sleep(Duration::from_secs(3600));
	}
}

fn main() {
	let args: Vec<String> = std::env::args().skip(1).collect();
	let args = match parse(&args) {
		Ok(a) => a,
		Err(e) => {
			println!("FATAL: {}", e);
			std::process::exit(2);
		}
	};

	println!("pid {}", std::process::id());
	if args.verbose {
		eprintln!("loading {} into {}", args.ldif, args.domain);
	}

	match args.fail.as_deref() {
		Some("before_start") => {
			println!("FATAL: Expected failure for testing");
			std::process::exit(1);
		}
		Some("silent") => std::process::exit(3),
		Some("hang") => {
			eprintln!("hanging before startup");
			hang();
		}
		_ => {}
	}

	if !Path::new(&args.ldif).is_file() {
		println!("FATAL: cannot read {}", args.ldif);
		std::process::exit(1);
	}

	let listener = match TcpListener::bind(("127.0.0.1", args.port)) {
		Ok(l) => l,
		Err(e) => {
			println!("FATAL: could not bind port {}: {}", args.port, e);
			std::process::exit(1);
		}
	};

	if args.spawn_child {
		match Command::new("sleep")
			.arg("300")
			.stdin(Stdio::null())
			.stdout(Stdio::null())
			.stderr(Stdio::null())
			.spawn()
		{
			Ok(child) => println!("grandchild {}", child.id()),
			Err(e) => eprintln!("could not spawn grandchild: {}", e),
		}
	}

	std::thread::spawn(move || {
		for stream in listener.incoming() {
			drop(stream);
		}
	});

	println!("STARTED");

	let ignore_stop = args.fail.as_deref() == Some("ignore_stop");
	for line in io::stdin().lock().lines() {
		let Ok(line) = line else { break };
		if line.trim() == "STOP" {
			if ignore_stop {
				eprintln!("ignoring STOP");
				continue;
			}
			break;
		}
	}
	if ignore_stop {
		hang();
	}

	println!("STOPPED");
}
