//! Error types shared by both tunnel endpoints.

use std::io;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum Error {
	/// The secret presented on the bootstrap channel was not accepted.
	#[error("authentication rejected")]
	AuthRejected,

	/// The peer closed the connection before the current operation finished.
	#[error("peer closed the connection")]
	PeerClosed,

	/// A connect or read deadline elapsed.
	#[error("timed out after {0:?}")]
	Timeout(Duration),

	/// The bootstrap port reply was not five ASCII digits naming a valid port.
	#[error("invalid port reply {0:?}")]
	InvalidPortReply(String),

	#[error(transparent)]
	Io(#[from] io::Error),
}

/// True for I/O errors that just mean the other side went away.
///
/// The relay treats these as a normal end of stream and the control channel
/// as a clean session end; neither reports them as failures.
pub fn is_disconnect(err: &io::Error) -> bool {
	matches!(
		err.kind(),
		io::ErrorKind::UnexpectedEof
			| io::ErrorKind::ConnectionReset
			| io::ErrorKind::ConnectionAborted
			| io::ErrorKind::BrokenPipe
			| io::ErrorKind::NotConnected
	)
}
