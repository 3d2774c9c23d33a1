//! Control-channel messages and their framing.
//!
//! The bootstrap and control channels exchange short frames terminated by a
//! single delimiter byte. Data channels carry raw application bytes and never
//! pass through here. The one unframed exception is the bootstrap port reply:
//! exactly five ASCII digits, so the client can read it without any
//! read-ahead into whatever follows on the wire.

use std::io;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::Error;

/// Terminates every frame on the bootstrap and control channels.
pub const DELIMITER: u8 = b'\n';

/// Heartbeat payload. Server -> client on the `inform` ticker, client ->
/// server from the keep-alive task.
pub const HEARTBEAT: &[u8] = b"pi";

/// Server -> client; asks the client to dial a new data channel.
pub const NEW_TASK: &[u8] = b"new";

/// Length of the unframed bootstrap port reply.
pub const PORT_REPLY_LEN: usize = 5;

/// Bootstrap reply sent instead of a port when the secret does not match.
pub const AUTH_REJECT: &[u8; PORT_REPLY_LEN] = b"00000";

/// Reads one frame, stripping the delimiter.
///
/// Fails with [`Error::PeerClosed`] if the stream ends before a delimiter
/// shows up.
pub async fn read_frame<R>(reader: &mut R) -> Result<Vec<u8>, Error>
where
	R: AsyncBufRead + Unpin,
{
	let mut frame = Vec::new();
	read_frame_into(reader, &mut frame).await?;
	Ok(frame)
}

/// Like [`read_frame`], but resumable: bytes already read stay in `buffer`
/// when the returned future is dropped, so a later call picks the same frame
/// back up. This is what a `select!` loop with a deadline branch must use.
///
/// On success the delimiter is stripped and `buffer` holds the payload.
pub async fn read_frame_into<R>(reader: &mut R, buffer: &mut Vec<u8>) -> Result<(), Error>
where
	R: AsyncBufRead + Unpin,
{
	let n = reader.read_until(DELIMITER, buffer).await?;
	if n == 0 {
		return Err(Error::PeerClosed);
	}
	if buffer.last() != Some(&DELIMITER) {
		// Stream ended in the middle of a frame.
		return Err(Error::PeerClosed);
	}
	buffer.pop();
	Ok(())
}

/// Appends the delimiter to `payload` and writes the whole frame.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> io::Result<()>
where
	W: AsyncWrite + Unpin,
{
	let mut frame = Vec::with_capacity(payload.len() + 1);
	frame.extend_from_slice(payload);
	frame.push(DELIMITER);
	writer.write_all(&frame).await?;
	writer.flush().await
}

/// Encodes a session port as the five-digit bootstrap reply, left-padded
/// with zeros. A `u16` port always fits.
pub fn encode_port_reply(port: u16) -> [u8; PORT_REPLY_LEN] {
	let mut reply = [0u8; PORT_REPLY_LEN];
	reply.copy_from_slice(format!("{port:05}").as_bytes());
	reply
}

/// Parses the five-byte bootstrap reply into a session port.
///
/// `"00000"` means the server rejected the secret and maps to
/// [`Error::AuthRejected`]; anything that is not five digits naming a port in
/// `1..=65535` is an [`Error::InvalidPortReply`].
pub fn parse_port_reply(reply: &[u8; PORT_REPLY_LEN]) -> Result<u16, Error> {
	if reply == AUTH_REJECT {
		return Err(Error::AuthRejected);
	}
	let text = std::str::from_utf8(reply).map_err(|_| Error::InvalidPortReply(format!("{reply:?}")))?;
	if !text.bytes().all(|b| b.is_ascii_digit()) {
		return Err(Error::InvalidPortReply(text.to_owned()));
	}
	let port: u32 = text.parse().map_err(|_| Error::InvalidPortReply(text.to_owned()))?;
	if port == 0 || port > u16::MAX as u32 {
		return Err(Error::InvalidPortReply(text.to_owned()));
	}
	Ok(port as u16)
}
