//! Full-duplex byte relay between two paired connections.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::error::is_disconnect;
use crate::monitor::{supervise_idle, ActivityTracker, Monitored};

/// Mints the identifier tagging all log lines of one relayed pair.
pub fn mint_task_id() -> String {
	let nanos = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_nanos();
	format!("task-{nanos}")
}

/// Pumps bytes both ways between `a` and `b` until one side closes or the
/// pair stays silent longer than `idle_timeout`.
///
/// Whichever copy direction finishes first cancels the shared token, which
/// unblocks the opposite direction and the idle supervisor; the idle
/// supervisor cancels the same token when the pair times out. Both
/// connections are dropped, and with that closed, before this returns, and
/// no spawned task outlives the call.
pub async fn relay<A, B>(a: A, b: B, a_name: &str, b_name: &str, task_id: &str, buffer_size: usize, idle_timeout: Duration)
where
	A: AsyncRead + AsyncWrite + Unpin + Send + 'static,
	B: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
	let activity = Arc::new(ActivityTracker::new());
	let rollback = CancellationToken::new();

	let (a_read, a_write) = tokio::io::split(Monitored::new(a, activity.clone()));
	let (b_read, b_write) = tokio::io::split(Monitored::new(b, activity.clone()));

	let supervisor = tokio::spawn(supervise_idle(activity, idle_timeout, rollback.clone()));

	let a_to_b = tokio::spawn(copy_until_cancelled(
		a_read,
		b_write,
		format!("[{task_id}] {a_name}->{b_name}"),
		buffer_size,
		rollback.clone(),
	));
	let b_to_a = tokio::spawn(copy_until_cancelled(
		b_read,
		a_write,
		format!("[{task_id}] {b_name}->{a_name}"),
		buffer_size,
		rollback.clone(),
	));

	let _ = a_to_b.await;
	let _ = b_to_a.await;

	rollback.cancel();
	let _ = supervisor.await;
	log::info!("[{task_id}] {a_name}<->{b_name} relay finished");
}

/// One copy direction. Reads into a fresh buffer of `buffer_size` bytes and
/// forwards until end of stream, an error or cancellation; then cancels the
/// token itself so its sibling direction stops too.
async fn copy_until_cancelled<R, W>(mut reader: R, mut writer: W, direction: String, buffer_size: usize, cancel: CancellationToken)
where
	R: AsyncRead + Unpin,
	W: AsyncWrite + Unpin,
{
	let mut buffer = vec![0u8; buffer_size];
	let mut forwarded: u64 = 0;
	loop {
		let read = tokio::select! {
			_ = cancel.cancelled() => break,
			read = reader.read(&mut buffer) => read,
		};
		match read {
			Ok(0) => break,
			Ok(n) => {
				let written = tokio::select! {
					_ = cancel.cancelled() => break,
					written = writer.write_all(&buffer[..n]) => written,
				};
				if let Err(err) = written {
					if !is_disconnect(&err) {
						log::error!("{direction} forwarding failed: {err}");
					}
					break;
				}
				forwarded += n as u64;
			}
			Err(err) => {
				if !is_disconnect(&err) {
					log::error!("{direction} forwarding failed: {err}");
				}
				break;
			}
		}
	}
	cancel.cancel();
	let _ = writer.shutdown().await;
	log::debug!("{direction} forwarded {forwarded} bytes");
}
