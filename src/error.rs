//! Error types for rsup operations

use std::error::Error;
use std::fmt;
use std::io;
use std::path::PathBuf;

/// Error returned by one of the three pipeline workers.
///
/// The variants mirror how failures are reported to the user: protocol
/// errors are fatal and terse, network errors are fatal but flagged as
/// transient (a retry may succeed), status-file errors tell the user to
/// delete the file, and local filesystem errors carry the path that
/// failed.
#[derive(Debug)]
pub enum WorkerError {
	/// Malformed framing or command from the server
	Protocol,

	/// Network read failure
	Read(io::Error),

	/// Server closed the connection in the middle of a message
	PrematureEof,

	/// Network write failure
	Write(io::Error),

	/// Status file corrupt or unusable
	Status(StatusError),

	/// Filesystem operation failed while applying an update
	Local { path: PathBuf, source: io::Error },

	/// Preformatted failure message
	Message(String),
}

impl WorkerError {
	/// Transient errors are worth retrying; protocol and status errors
	/// are not.
	pub fn is_transient(&self) -> bool {
		matches!(self, WorkerError::Read(_) | WorkerError::Write(_) | WorkerError::PrematureEof)
	}

	pub fn local(path: impl Into<PathBuf>, source: io::Error) -> Self {
		WorkerError::Local { path: path.into(), source }
	}
}

impl fmt::Display for WorkerError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			WorkerError::Protocol => write!(f, "Protocol error"),
			WorkerError::Read(e) => write!(f, "Network read failure: {}", e),
			WorkerError::PrematureEof => write!(f, "Premature EOF from server"),
			WorkerError::Write(e) => write!(f, "Network write failure: {}", e),
			WorkerError::Status(e) => write!(f, "{}", e),
			WorkerError::Local { path, source } => {
				write!(f, "{}: {}", path.display(), source)
			}
			WorkerError::Message(msg) => write!(f, "{}", msg),
		}
	}
}

impl Error for WorkerError {}

impl From<StatusError> for WorkerError {
	fn from(e: StatusError) -> Self {
		WorkerError::Status(e)
	}
}

/// Status file errors
#[derive(Debug)]
pub enum StatusError {
	/// The file exists but its contents are unusable
	Corrupt { path: PathBuf, line: u64, reason: String },

	/// Could not create the replacement file or its directories
	Create { path: PathBuf, source: io::Error },

	/// Write or rename failure while producing the replacement file
	Write { path: PathBuf, source: io::Error },
}

impl fmt::Display for StatusError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			StatusError::Corrupt { path, line, reason } => write!(
				f,
				"Error in status file \"{}\" (line {}): {}.  Delete it and try again",
				path.display(),
				line,
				reason
			),
			StatusError::Create { path, source } => {
				write!(f, "Cannot create \"{}\": {}", path.display(), source)
			}
			StatusError::Write { path, source } => {
				write!(f, "Write failure on \"{}\": {}", path.display(), source)
			}
		}
	}
}

impl Error for StatusError {}

/// Multiplexer failure, recorded by whichever of the sender or receiver
/// tasks hit it first.
#[derive(Debug)]
pub enum MuxError {
	/// Peer violated the multiplexer protocol
	Protocol,

	/// Socket I/O failure
	Io(io::Error),
}

impl fmt::Display for MuxError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			MuxError::Protocol => write!(f, "Protocol error"),
			MuxError::Io(e) => write!(f, "{}", e),
		}
	}
}

impl Error for MuxError {}

impl From<io::Error> for MuxError {
	fn from(e: io::Error) -> Self {
		MuxError::Io(e)
	}
}

/// RCS file parsing errors
#[derive(Debug)]
pub enum RcsError {
	/// Could not open or map the file
	Open(io::Error),

	/// The file does not follow the RCS grammar
	Syntax { path: PathBuf, detail: &'static str },
}

impl fmt::Display for RcsError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			RcsError::Open(e) => write!(f, "{}", e),
			RcsError::Syntax { path, detail } => {
				write!(f, "\"{}\" is not a valid RCS file: {}", path.display(), detail)
			}
		}
	}
}

impl Error for RcsError {}

/// Configuration errors
#[derive(Debug)]
pub enum ConfigError {
	/// Could not read the configuration file
	Io { path: PathBuf, source: io::Error },

	/// The file is not valid TOML
	Parse { path: PathBuf, message: String },

	/// The contents are valid TOML but not a valid configuration
	Invalid { message: String },
}

impl fmt::Display for ConfigError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			ConfigError::Io { path, source } => {
				write!(f, "Cannot read \"{}\": {}", path.display(), source)
			}
			ConfigError::Parse { path, message } => {
				write!(f, "Cannot parse \"{}\": {}", path.display(), message)
			}
			ConfigError::Invalid { message } => write!(f, "Invalid configuration: {}", message),
		}
	}
}

impl Error for ConfigError {}

// vim: ts=4
