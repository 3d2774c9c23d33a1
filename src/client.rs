//! NAT-side endpoint: authenticates against the server, keeps the control
//! channel alive and dials data channels on demand.

use std::time::Duration;

use tokio::io::{AsyncReadExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::config::ClientConfig;
use crate::error::{is_disconnect, Error};
use crate::relay::{mint_task_id, relay};
use crate::{messages, CONTROL_READ_TIMEOUT, HANDSHAKE_TIMEOUT};

/// Runs the whole client: bootstrap handshake, then the session until the
/// control channel dies.
pub async fn run(config: ClientConfig) -> Result<(), Error> {
	let session_port = bootstrap(&config).await?;
	log::info!("Authenticated, session port is {session_port}");
	run_session(config, session_port).await
}

/// Dials the bootstrap port, presents the secret and reads the five-byte
/// port reply.
///
/// The reply is unframed and read with `read_exact` straight off the socket;
/// a buffered reader here could swallow bytes past the reply boundary.
pub async fn bootstrap(config: &ClientConfig) -> Result<u16, Error> {
	let addr = format!("{}:{}", config.server_ip, config.main_port);
	let mut conn = dial(&addr).await?;
	log::info!("Connected to bootstrap port at {addr}");
	messages::write_frame(&mut conn, config.secret.as_bytes()).await?;

	let mut reply = [0u8; messages::PORT_REPLY_LEN];
	conn.read_exact(&mut reply).await.map_err(|err| match err.kind() {
		std::io::ErrorKind::UnexpectedEof => Error::PeerClosed,
		_ => Error::Io(err),
	})?;
	messages::parse_port_reply(&reply)
}

/// Establishes the control channel on the issued session port and runs the
/// keep-alive and dispatch tasks until either one gives up.
async fn run_session(config: ClientConfig, session_port: u16) -> Result<(), Error> {
	let addr = format!("{}:{}", config.server_ip, session_port);
	let control = dial(&addr).await?;
	log::info!("Control channel established to {addr}");
	let (read_half, write_half) = control.into_split();

	let teardown = CancellationToken::new();
	let keep_alive = tokio::spawn(keep_alive(
		write_half,
		Duration::from_secs(config.keep_alive_time),
		teardown.clone(),
	));
	let dispatch = tokio::spawn(dispatch(read_half, config, session_port, teardown.clone()));

	let _ = keep_alive.await;
	let _ = dispatch.await;
	log::info!("Control channel closed, session over");
	Ok(())
}

async fn dial(addr: &str) -> Result<TcpStream, Error> {
	match timeout(HANDSHAKE_TIMEOUT, TcpStream::connect(addr)).await {
		Ok(Ok(conn)) => Ok(conn),
		Ok(Err(err)) => Err(Error::Io(err)),
		Err(_) => Err(Error::Timeout(HANDSHAKE_TIMEOUT)),
	}
}

/// Writes a heartbeat frame on every tick until the control channel dies.
async fn keep_alive(mut control: OwnedWriteHalf, period: Duration, teardown: CancellationToken) {
	let mut ticker = tokio::time::interval(period);
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
				log::debug!("Sent heartbeat to server");
			}
		}
	}
	teardown.cancel();
	log::debug!("Keep-alive task exited");
}

/// Reads control frames and acts on them: heartbeats are dropped, new-task
/// frames spawn a task handler, the public-port announcement is logged.
///
/// A quiet control channel is not an error; the read deadline elapsing only
/// logs and keeps listening. Frame bytes already read when the deadline
/// fires stay buffered, so the next pass resumes the same frame.
async fn dispatch(read_half: OwnedReadHalf, config: ClientConfig, session_port: u16, teardown: CancellationToken) {
	let mut reader = BufReader::new(read_half);
	let mut frame = Vec::new();
	loop {
		let read = tokio::select! {
			_ = teardown.cancelled() => break,
			_ = tokio::time::sleep(CONTROL_READ_TIMEOUT) => {
				log::debug!("Control channel quiet for {}s, still listening", CONTROL_READ_TIMEOUT.as_secs());
				continue;
			}
			read = messages::read_frame_into(&mut reader, &mut frame) => read,
		};
		match read {
			Ok(()) => {}
			Err(Error::PeerClosed) => {
				log::info!("Server closed the control channel");
				break;
			}
			Err(err) => {
				log::error!("Reading control channel failed: {err}");
				break;
			}
		}
		log::debug!("Received control frame {:?} ({} bytes)", String::from_utf8_lossy(&frame), frame.len() + 1);

		if frame == messages::HEARTBEAT {
			// Nothing to do, the read itself was the point.
		} else if frame == messages::NEW_TASK {
			log::info!("Server announced a new public connection");
			tokio::spawn(handle_task(config.clone(), session_port));
		} else if frame.starts_with(b":") {
			log::info!("Public url: http://{}{}", config.server_ip, String::from_utf8_lossy(&frame));
		} else {
			log::error!("Unexpected control frame {:?}", String::from_utf8_lossy(&frame));
		}
		frame.clear();
	}
	teardown.cancel();
	log::debug!("Dispatch task exited");
}

/// Answers one new-task notification: dials a fresh data channel to the
/// server and a connection to the local service, then relays between them.
/// No retry on failure; the server drops the unpaired public connection
/// after its pairing timeout.
async fn handle_task(config: ClientConfig, session_port: u16) {
	let data_addr = format!("{}:{}", config.server_ip, session_port);
	let data_conn = match dial(&data_addr).await {
		Ok(conn) => conn,
		Err(err) => {
			log::error!("Dialing data channel to {data_addr} failed: {err}");
			return;
		}
	};
	let local_addr = format!("127.0.0.1:{}", config.local_port);
	let local_conn = match dial(&local_addr).await {
		Ok(conn) => conn,
		Err(err) => {
			// The data channel is dropped with it; the server times the
			// unpaired public connection out.
			log::error!("Dialing local service at {local_addr} failed: {err}");
			return;
		}
	};

	let task_id = mint_task_id();
	log::info!("[{task_id}] Forwarding between {local_addr} and {data_addr}");
	relay(
		local_conn,
		data_conn,
		"local",
		"server",
		&task_id,
		config.buffer_size * 1024,
		Duration::from_secs(config.idle_timeout),
	)
	.await;
}
