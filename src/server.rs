//! Publicly reachable endpoint: authenticates clients, issues session ports
//! and pairs public connections with client-dialed data channels.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::config::ServerConfig;
use crate::error::{is_disconnect, Error};
use crate::relay::{mint_task_id, relay};
use crate::{messages, HANDSHAKE_TIMEOUT, PAIRING_TIMEOUT};

/// The bootstrap listener plus the options every session inherits.
pub struct Server {
	listener: TcpListener,
	config: ServerConfig,
}

impl Server {
	/// Binds the bootstrap listener on `main-port`.
	pub async fn bind(config: ServerConfig) -> Result<Server, Error> {
		let listener = TcpListener::bind(("0.0.0.0", config.main_port)).await?;
		Ok(Server { listener, config })
	}

	/// Address the bootstrap listener ended up bound on.
	pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
		self.listener.local_addr()
	}

	/// Accepts bootstrap connections forever. Each one is handled in its own
	/// task so a slow or stuck client cannot block the accept loop.
	pub async fn run(self) -> Result<(), Error> {
		loop {
			let (conn, peer) = match self.listener.accept().await {
				Ok(accepted) => accepted,
				Err(err) => {
					log::error!("Accepting bootstrap connection failed: {err}");
					continue;
				}
			};
			log::info!("Client connected to bootstrap port from {peer}");
			let config = self.config.clone();
			tokio::spawn(async move {
				if let Err(err) = authenticate(conn, peer, config).await {
					log::error!("Bootstrap handshake with {peer} failed: {err}");
				}
			});
		}
	}
}

/// Reads the secret off a fresh bootstrap connection and answers it.
///
/// A wrong secret gets the five-byte reject reply and the connection is
/// dropped. A correct one gets a freshly bound session listener, whose port
/// is sent back as the five-digit reply before the session manager takes
/// over in its own task. The bootstrap connection itself is closed either
/// way; the client comes back on the session port.
async fn authenticate(mut conn: TcpStream, peer: SocketAddr, config: ServerConfig) -> Result<(), Error> {
	let (read_half, mut write_half) = conn.split();
	let mut reader = BufReader::new(read_half);
	let frame = match timeout(HANDSHAKE_TIMEOUT, messages::read_frame(&mut reader)).await {
		Ok(frame) => frame?,
		Err(_) => return Err(Error::Timeout(HANDSHAKE_TIMEOUT)),
	};

	if !frame.starts_with(config.secret.as_bytes()) {
		write_half.write_all(messages::AUTH_REJECT).await?;
		return Err(Error::AuthRejected);
	}

	let session_listener = TcpListener::bind("0.0.0.0:0").await?;
	let session_port = session_listener.local_addr()?.port();
	write_half.write_all(&messages::encode_port_reply(session_port)).await?;
	log::info!("Issued session port {session_port} to {peer}");

	tokio::spawn(run_session(session_listener, config));
	Ok(())
}

/// Drives one client session from control-channel establishment to teardown.
///
/// The first connection accepted on the session listener is the client's
/// control channel. After announcing the public port on it, three tasks
/// share one cancellation token: `inform` writes heartbeats and new-task
/// notifications, `accept_public` queues arriving public connections, and
/// `accept_data` pairs client-dialed data channels with queued public
/// connections. The first task to fail cancels the token and the rest wind
/// down; relays started before teardown keep running on their own.
async fn run_session(session_listener: TcpListener, config: ServerConfig) {
	let session_port = match session_listener.local_addr() {
		Ok(addr) => addr.port(),
		Err(err) => {
			log::error!("Reading session listener address failed: {err}");
			return;
		}
	};

	let (control, control_peer) = match session_listener.accept().await {
		Ok(accepted) => accepted,
		Err(err) => {
			log::error!("Accepting control channel on port {session_port} failed: {err}");
			return;
		}
	};
	log::info!("Control channel established with {control_peer}");

	// The write side goes to the inform task; the read side is never read
	// from, it is only held so the socket stays fully open until teardown.
	let (_control_read, mut control_write) = control.into_split();

	let public_listener = match TcpListener::bind("0.0.0.0:0").await {
		Ok(listener) => listener,
		Err(err) => {
			log::error!("Binding public listener for {control_peer} failed: {err}");
			return;
		}
	};
	let public_port = match public_listener.local_addr() {
		Ok(addr) => addr.port(),
		Err(err) => {
			log::error!("Reading public listener address failed: {err}");
			return;
		}
	};
	log::info!("Public listener for {control_peer} is on port {public_port}");
	if let Err(err) = messages::write_frame(&mut control_write, format!(":{public_port}").as_bytes()).await {
		log::error!("Announcing public port to {control_peer} failed: {err}");
		return;
	}

	let teardown = CancellationToken::new();
	let (notify_tx, notify_rx) = mpsc::channel::<()>(config.conn_chan_count);
	let (pending_tx, pending_rx) = mpsc::channel::<TcpStream>(config.conn_chan_count);

	let inform = tokio::spawn(inform(
		control_write,
		notify_rx,
		Duration::from_secs(config.keep_alive_time),
		teardown.clone(),
	));
	let accept_public = tokio::spawn(accept_public(public_listener, pending_tx, notify_tx, teardown.clone()));
	let accept_data = tokio::spawn(accept_data(session_listener, pending_rx, config, teardown.clone()));

	let _ = inform.await;
	let _ = accept_public.await;
	let _ = accept_data.await;
	log::info!("Session on port {session_port} torn down");
}

/// Sole writer on the control channel: heartbeats on the keep-alive ticker,
/// a new-task frame for every queued notification. Any write error means the
/// client is gone, so the whole session is cancelled.
async fn inform(
	mut control: OwnedWriteHalf,
	mut notifications: mpsc::Receiver<()>,
	keep_alive: Duration,
	teardown: CancellationToken,
) {
	let mut ticker = tokio::time::interval(keep_alive);
	ticker.tick().await; // Skip the immediate first tick.
	loop {
		tokio::select! {
			_ = teardown.cancelled() => break,
			_ = ticker.tick() => {
				if let Err(err) = messages::write_frame(&mut control, messages::HEARTBEAT).await {
					if !is_disconnect(&err) {
						log::error!("Sending heartbeat failed: {err}");
					}
					break;
				}
				log::debug!("Sent heartbeat to client");
			}
			notification = notifications.recv() => match notification {
				Some(()) => {
					if let Err(err) = messages::write_frame(&mut control, messages::NEW_TASK).await {
						if !is_disconnect(&err) {
							log::error!("Sending new-task notification failed: {err}");
						}
						break;
					}
					log::debug!("Notified client of a new public connection");
				}
				None => break,
			}
		}
	}
	teardown.cancel();
	log::debug!("Inform task exited");
}

/// Accepts public connections and queues them for pairing.
///
/// A pairing slot is reserved before the notification is sent, so the client
/// never hears about a connection that has no place in the queue. Either
/// queue being full means the client is not keeping up: the newcomer is
/// dropped and the loop keeps serving.
async fn accept_public(
	listener: TcpListener,
	pending: mpsc::Sender<TcpStream>,
	notify: mpsc::Sender<()>,
	teardown: CancellationToken,
) {
	loop {
		let accepted = tokio::select! {
			_ = teardown.cancelled() => break,
			accepted = listener.accept() => accepted,
		};
		let (conn, peer) = match accepted {
			Ok(accepted) => accepted,
			Err(err) => {
				log::error!("Accepting public connection failed: {err}");
				continue;
			}
		};
		log::info!("Public connection from {peer}");

		let slot = match pending.try_reserve() {
			Ok(slot) => slot,
			Err(_) => {
				log::error!("Pending queue full, dropping public connection from {peer}");
				continue;
			}
		};
		match notify.try_send(()) {
			Ok(()) => slot.send(conn),
			Err(_) => {
				// The reserved pairing slot is released when `slot` drops.
				log::error!("Notification queue full, dropping public connection from {peer}");
			}
		}
	}
	log::debug!("Public accept loop exited");
}

/// Accepts data channels the client dials back on the session port and pairs
/// each with the oldest queued public connection.
///
/// Pairing tasks deliberately survive session teardown: a pair that was
/// already matched keeps relaying until it finishes on its own, and an
/// unmatched data channel is dropped after the pairing timeout at the
/// latest.
async fn accept_data(
	listener: TcpListener,
	pending: mpsc::Receiver<TcpStream>,
	config: ServerConfig,
	teardown: CancellationToken,
) {
	let pending = Arc::new(Mutex::new(pending));
	loop {
		let accepted = tokio::select! {
			_ = teardown.cancelled() => break,
			accepted = listener.accept() => accepted,
		};
		let (data_conn, peer) = match accepted {
			Ok(accepted) => accepted,
			Err(err) => {
				log::error!("Accepting data channel failed: {err}");
				continue;
			}
		};
		log::info!("Data channel from {peer}");

		let pending = pending.clone();
		let config = config.clone();
		tokio::spawn(async move {
			let waited = timeout(PAIRING_TIMEOUT, async { pending.lock().await.recv().await }).await;
			match waited {
				Ok(Some(public_conn)) => {
					let task_id = mint_task_id();
					log::info!("[{task_id}] Paired data channel {peer} with a public connection");
					relay(
						data_conn,
						public_conn,
						"task",
						"web",
						&task_id,
						config.buffer_size * 1024,
						Duration::from_secs(config.idle_timeout),
					)
					.await;
				}
				Ok(None) => {
					log::debug!("Pending queue closed, dropping data channel from {peer}");
				}
				Err(_) => {
					log::error!(
						"No public connection within {}s, dropping data channel from {peer}",
						PAIRING_TIMEOUT.as_secs()
					);
				}
			}
		});
	}
	log::debug!("Data accept loop exited");
}
