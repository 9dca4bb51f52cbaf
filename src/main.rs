use clap::{Arg, ArgAction, Command};
use std::path::PathBuf;
use std::process::ExitCode;

use rsup::config::{self, Overrides};
use rsup::logging::*;
use rsup::session;

/// Exclusive lock held for the duration of a run (the -l option).
struct FileLock {
	path: PathBuf,
}

impl FileLock {
	fn acquire(path: PathBuf) -> Result<Self, String> {
		if path.exists() {
			return Err(format!(
				"\"{}\" is already locked by another process",
				path.display()
			));
		}
		let pid = std::process::id();
		std::fs::write(&path, format!("{:10}\n", pid))
			.map_err(|e| format!("Error locking \"{}\": {}", path.display(), e))?;
		Ok(FileLock { path })
	}
}

impl Drop for FileLock {
	fn drop(&mut self) {
		let _ = std::fs::remove_file(&self.path);
	}
}

fn main() -> ExitCode {
	let matches = Command::new("rsup")
		.version(env!("CARGO_PKG_VERSION"))
		.about("CVSup checkout-mode client")
		// -h selects the host, as csup has it; help stays on --help.
		.disable_help_flag(true)
		.arg(Arg::new("help").long("help").action(ArgAction::Help).help("Print help"))
		.arg(
			Arg::new("base")
				.short('b')
				.value_name("base")
				.help("Override the configured \"base\" directory"),
		)
		.arg(
			Arg::new("colldir")
				.short('c')
				.value_name("collDir")
				.help("Subdirectory of \"base\" for collections (default \"sup\")"),
		)
		.arg(Arg::new("host").short('h').value_name("host").help("Override the server host name"))
		.arg(
			Arg::new("lockfile")
				.short('l')
				.value_name("lockfile")
				.help("Lock file during update; fail if already locked"),
		)
		.arg(
			Arg::new("verbosity")
				.short('L')
				.value_name("n")
				.help("Verbosity level (0..2, default 1)"),
		)
		.arg(Arg::new("port").short('p').value_name("port").help("Alternate server port"))
		.arg(
			Arg::new("trust")
				.short('s')
				.action(ArgAction::SetTrue)
				.help("Don't stat client files; trust the checkouts file"),
		)
		.arg(
			Arg::new("compress")
				.short('z')
				.action(ArgAction::SetTrue)
				.help("Enable compression for all collections"),
		)
		.arg(
			Arg::new("nocompress")
				.short('Z')
				.action(ArgAction::SetTrue)
				.help("Disable compression for all collections"),
		)
		.arg(Arg::new("config").required(true).value_name("configfile"))
		.get_matches();

	let level = match matches.get_one::<String>("verbosity").map(|s| s.as_str()) {
		Some("0") => "error",
		None | Some("1") => "info",
		_ => "debug",
	};
	init_tracing_level(level);

	let over = Overrides {
		host: matches.get_one::<String>("host").cloned(),
		base: matches.get_one::<String>("base").map(PathBuf::from),
		colldir: matches.get_one::<String>("colldir").cloned(),
		port: matches.get_one::<String>("port").and_then(|p| p.parse().ok()),
		compress: if matches.get_flag("compress") {
			Some(true)
		} else if matches.get_flag("nocompress") {
			Some(false)
		} else {
			None
		},
		trust_status_file: matches.get_flag("trust"),
	};

	let file = matches.get_one::<String>("config").expect("required argument");
	debug!("Parsing configuration \"{}\"", file);
	let cfg = match config::load(std::path::Path::new(file), &over) {
		Ok(cfg) => cfg,
		Err(e) => {
			error!("{}", e);
			return ExitCode::FAILURE;
		}
	};

	let _lock = match matches.get_one::<String>("lockfile") {
		Some(path) => match FileLock::acquire(PathBuf::from(path)) {
			Ok(lock) => Some(lock),
			Err(e) => {
				error!("{}", e);
				return ExitCode::FAILURE;
			}
		},
		None => None,
	};

	let runtime = match tokio::runtime::Runtime::new() {
		Ok(rt) => rt,
		Err(e) => {
			error!("Cannot start runtime: {}", e);
			return ExitCode::FAILURE;
		}
	};
	match runtime.block_on(session::run(cfg)) {
		Ok(()) => ExitCode::SUCCESS,
		Err(e) => {
			error!("{}", e);
			ExitCode::FAILURE
		}
	}
}

// vim: ts=4
