//! Connection activity tracking and idle supervision.

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Shared record of when a relayed pair last moved bytes, at second
/// granularity.
///
/// Both directions of a pair feed one tracker. The hot path avoids any
/// read-modify-write: if the stored second already equals the current one the
/// update is skipped entirely, so continuous traffic touches the record at
/// most once per second per direction. `fetch_max` keeps the timestamp from
/// ever going backwards when both directions race across a second boundary.
pub struct ActivityTracker {
	started: Instant,
	last_activity: AtomicU64,
}

impl ActivityTracker {
	pub fn new() -> Self {
		Self {
			started: Instant::now(),
			last_activity: AtomicU64::new(0),
		}
	}

	fn now(&self) -> u64 {
		self.started.elapsed().as_secs()
	}

	/// Records that bytes moved just now.
	pub fn touch(&self) {
		let now = self.now();
		if now == self.last_activity.load(Ordering::Relaxed) {
			return;
		}
		self.last_activity.fetch_max(now, Ordering::Relaxed);
	}

	/// Seconds since the last recorded activity.
	pub fn idle_for(&self) -> u64 {
		self.now().saturating_sub(self.last_activity.load(Ordering::Relaxed))
	}
}

impl Default for ActivityTracker {
	fn default() -> Self {
		Self::new()
	}
}

/// Ticks once a second; when the pair has been idle longer than
/// `idle_timeout` it cancels `rollback`, which closes both halves of the
/// pair. Exits as soon as `rollback` is cancelled by anyone, so it never
/// outlives the relay it supervises.
pub async fn supervise_idle(activity: Arc<ActivityTracker>, idle_timeout: Duration, rollback: CancellationToken) {
	let mut ticker = tokio::time::interval(Duration::from_secs(1));
	ticker.tick().await; // Skip the immediate first tick.
	loop {
		tokio::select! {
			_ = rollback.cancelled() => return,
			_ = ticker.tick() => {
				if activity.idle_for() > idle_timeout.as_secs() {
					log::debug!("Pair idle for more than {}s, rolling back", idle_timeout.as_secs());
					rollback.cancel();
					return;
				}
			}
		}
	}
}

/// Wraps a stream so that every successful read or write of at least one
/// byte touches the shared [`ActivityTracker`].
pub struct Monitored<T> {
	inner: T,
	activity: Arc<ActivityTracker>,
}

impl<T> Monitored<T> {
	pub fn new(inner: T, activity: Arc<ActivityTracker>) -> Self {
		Self { inner, activity }
	}
}

impl<T: AsyncRead + Unpin> AsyncRead for Monitored<T> {
	fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
		let filled_before = buf.filled().len();
		let poll = Pin::new(&mut self.inner).poll_read(cx, buf);
		if let Poll::Ready(Ok(())) = &poll {
			if buf.filled().len() > filled_before {
				self.activity.touch();
			}
		}
		poll
	}
}

impl<T: AsyncWrite + Unpin> AsyncWrite for Monitored<T> {
	fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
		let poll = Pin::new(&mut self.inner).poll_write(cx, buf);
		if let Poll::Ready(Ok(written)) = &poll {
			if *written > 0 {
				self.activity.touch();
			}
		}
		poll
	}

	fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		Pin::new(&mut self.inner).poll_flush(cx)
	}

	fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		Pin::new(&mut self.inner).poll_shutdown(cx)
	}
}
