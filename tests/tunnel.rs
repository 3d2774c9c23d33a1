//! End-to-end tests over real loopback sockets.
//!
//! The server-side tests walk the wire protocol the way a client would:
//! authenticate on the bootstrap port, open the control channel, then play
//! the public and data sides of a pairing. The client-side tests script the
//! server instead and run the real client against it.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use reverse_tunnel::config::{ClientConfig, ServerConfig};
use reverse_tunnel::server::Server;
use reverse_tunnel::{client, messages, Error};

const SECRET: &str = "s";

fn server_config() -> ServerConfig {
	ServerConfig {
		main_port: 0,
		secret: SECRET.to_owned(),
		keep_alive_time: 60,
		conn_chan_count: 100,
		buffer_size: 5,
		idle_timeout: 30,
	}
}

/// Starts a server on an ephemeral port and returns the bootstrap port.
async fn start_server(config: ServerConfig) -> u16 {
	let server = Server::bind(config).await.expect("bind server");
	let port = server.local_addr().expect("server addr").port();
	tokio::spawn(server.run());
	port
}

async fn dial(port: u16) -> TcpStream {
	TcpStream::connect(("127.0.0.1", port)).await.expect("dial loopback port")
}

/// Plays the bootstrap phase and returns the issued session port.
async fn authenticate(bootstrap: u16, secret: &str) -> u16 {
	let mut conn = dial(bootstrap).await;
	messages::write_frame(&mut conn, secret.as_bytes()).await.expect("send secret");
	let mut reply = [0u8; messages::PORT_REPLY_LEN];
	timeout(Duration::from_secs(10), conn.read_exact(&mut reply))
		.await
		.expect("port reply in time")
		.expect("read port reply");
	messages::parse_port_reply(&reply).expect("session port")
}

async fn read_frame(reader: &mut BufReader<OwnedReadHalf>) -> Vec<u8> {
	timeout(Duration::from_secs(10), messages::read_frame(reader))
		.await
		.expect("frame in time")
		.expect("read frame")
}

/// Opens the control channel on the session port and consumes the public
/// port announcement.
async fn open_control(session_port: u16) -> (BufReader<OwnedReadHalf>, OwnedWriteHalf, u16) {
	let control = dial(session_port).await;
	let (read_half, write_half) = control.into_split();
	let mut reader = BufReader::new(read_half);

	let frame = read_frame(&mut reader).await;
	assert!(frame.starts_with(b":"), "expected the public port announcement, got {frame:?}");
	let public_port: u16 = String::from_utf8_lossy(&frame[1..]).parse().expect("public port digits");
	(reader, write_half, public_port)
}

#[tokio::test]
async fn handshake_issues_a_working_session_port() {
	let bootstrap = start_server(ServerConfig {
		keep_alive_time: 1,
		..server_config()
	})
	.await;

	let session_port = authenticate(bootstrap, SECRET).await;
	assert_ne!(session_port, 0);

	let (mut control, _write, public_port) = open_control(session_port).await;
	assert_ne!(public_port, 0);

	// With the session otherwise idle, only heartbeats flow.
	assert_eq!(read_frame(&mut control).await, messages::HEARTBEAT);
	assert_eq!(read_frame(&mut control).await, messages::HEARTBEAT);
}

#[tokio::test]
async fn wrong_secret_is_rejected() {
	let bootstrap = start_server(server_config()).await;

	let mut conn = dial(bootstrap).await;
	messages::write_frame(&mut conn, b"wrong").await.expect("send secret");

	let mut reply = [0u8; messages::PORT_REPLY_LEN];
	timeout(Duration::from_secs(10), conn.read_exact(&mut reply))
		.await
		.expect("reply in time")
		.expect("read reply");
	assert_eq!(&reply, messages::AUTH_REJECT);

	// The server hangs up right after the reject reply.
	let mut rest = [0u8; 1];
	let read = timeout(Duration::from_secs(10), conn.read(&mut rest)).await.expect("close in time");
	assert!(matches!(read, Ok(0) | Err(_)), "expected the bootstrap connection to be closed");
}

#[tokio::test]
async fn tunnels_bytes_to_the_local_side_and_back() {
	let bootstrap = start_server(server_config()).await;
	let session_port = authenticate(bootstrap, SECRET).await;
	let (mut control, _write, public_port) = open_control(session_port).await;

	let mut public = dial(public_port).await;
	public.write_all(b"hello world").await.expect("send request");

	assert_eq!(read_frame(&mut control).await, messages::NEW_TASK);

	// Dial the data channel the way the client would after the notification.
	let mut data = dial(session_port).await;

	let mut request = [0u8; 11];
	timeout(Duration::from_secs(10), data.read_exact(&mut request))
		.await
		.expect("request in time")
		.expect("read request");
	assert_eq!(&request, b"hello world");

	data.write_all(b"ok\n").await.expect("send reply");
	let mut reply = [0u8; 3];
	timeout(Duration::from_secs(10), public.read_exact(&mut reply))
		.await
		.expect("reply in time")
		.expect("read reply");
	assert_eq!(&reply, b"ok\n");
}

#[tokio::test]
async fn overflowing_the_pending_queue_drops_the_newcomer() {
	let bootstrap = start_server(ServerConfig {
		conn_chan_count: 1,
		..server_config()
	})
	.await;
	let session_port = authenticate(bootstrap, SECRET).await;
	let (mut control, _write, public_port) = open_control(session_port).await;

	let mut first = dial(public_port).await;
	assert_eq!(read_frame(&mut control).await, messages::NEW_TASK);

	// The only pairing slot is taken, so a second public connection is
	// closed immediately.
	let mut second = dial(public_port).await;
	let mut buf = [0u8; 1];
	let read = timeout(Duration::from_secs(10), second.read(&mut buf)).await.expect("drop in time");
	assert!(matches!(read, Ok(0) | Err(_)), "expected the second public connection to be dropped");

	// The queued first connection still pairs and relays fine.
	let mut data = dial(session_port).await;
	first.write_all(b"ping").await.expect("send through first");
	let mut request = [0u8; 4];
	timeout(Duration::from_secs(10), data.read_exact(&mut request))
		.await
		.expect("request in time")
		.expect("read request");
	assert_eq!(&request, b"ping");
}

#[tokio::test]
async fn idle_pairs_are_closed_but_the_session_survives() {
	let bootstrap = start_server(ServerConfig {
		idle_timeout: 1,
		..server_config()
	})
	.await;
	let session_port = authenticate(bootstrap, SECRET).await;
	let (mut control, _write, public_port) = open_control(session_port).await;

	let mut public = dial(public_port).await;
	assert_eq!(read_frame(&mut control).await, messages::NEW_TASK);
	let mut data = dial(session_port).await;

	// Prove the pair is live, then let it go quiet.
	public.write_all(b"x").await.expect("send through pair");
	let mut byte = [0u8; 1];
	timeout(Duration::from_secs(10), data.read_exact(&mut byte))
		.await
		.expect("byte in time")
		.expect("read byte");

	let mut buf = [0u8; 1];
	let read = timeout(Duration::from_secs(10), data.read(&mut buf)).await.expect("idle close in time");
	assert!(matches!(read, Ok(0) | Err(_)), "expected the data half to be closed");
	let read = timeout(Duration::from_secs(10), public.read(&mut buf)).await.expect("idle close in time");
	assert!(matches!(read, Ok(0) | Err(_)), "expected the public half to be closed");

	// The control channel is untouched by the rollback: a read only times
	// out, it does not hit end of stream.
	let still_open = timeout(Duration::from_secs(1), messages::read_frame(&mut control)).await;
	assert!(still_open.is_err(), "expected the control channel to stay open and quiet");
}

#[tokio::test]
async fn client_runs_a_full_session() {
	let bootstrap_listener = TcpListener::bind("127.0.0.1:0").await.expect("bind bootstrap");
	let bootstrap_port = bootstrap_listener.local_addr().expect("bootstrap addr").port();
	let local_listener = TcpListener::bind("127.0.0.1:0").await.expect("bind local service");
	let local_port = local_listener.local_addr().expect("local addr").port();

	let client_handle = tokio::spawn(client::run(ClientConfig {
		server_ip: "127.0.0.1".to_owned(),
		main_port: bootstrap_port,
		local_port,
		secret: SECRET.to_owned(),
		keep_alive_time: 1,
		buffer_size: 5,
		idle_timeout: 30,
	}));

	// Bootstrap phase, scripted from the server's side.
	let (bootstrap_conn, _) = timeout(Duration::from_secs(10), bootstrap_listener.accept())
		.await
		.expect("bootstrap dial in time")
		.expect("accept bootstrap");
	let (read_half, mut write_half) = bootstrap_conn.into_split();
	let mut reader = BufReader::new(read_half);
	assert_eq!(read_frame(&mut reader).await, SECRET.as_bytes());

	let session_listener = TcpListener::bind("127.0.0.1:0").await.expect("bind session listener");
	let session_port = session_listener.local_addr().expect("session addr").port();
	write_half.write_all(&messages::encode_port_reply(session_port)).await.expect("send port reply");
	drop(write_half);
	drop(reader);

	// The client comes back on the session port with its control channel.
	let (control, _) = timeout(Duration::from_secs(10), session_listener.accept())
		.await
		.expect("control dial in time")
		.expect("accept control");
	let (control_read, mut control_write) = control.into_split();
	let mut control_reader = BufReader::new(control_read);
	messages::write_frame(&mut control_write, b":9999").await.expect("announce public port");

	// Heartbeats tick in from the client's keep-alive task.
	assert_eq!(read_frame(&mut control_reader).await, messages::HEARTBEAT);

	// A new-task frame makes the client dial back a data channel and its
	// local service.
	messages::write_frame(&mut control_write, messages::NEW_TASK).await.expect("send new task");
	let (mut data, _) = timeout(Duration::from_secs(10), session_listener.accept())
		.await
		.expect("data dial in time")
		.expect("accept data channel");
	let (mut local, _) = timeout(Duration::from_secs(10), local_listener.accept())
		.await
		.expect("local dial in time")
		.expect("accept local connection");

	data.write_all(b"hello world").await.expect("send request");
	let mut request = [0u8; 11];
	timeout(Duration::from_secs(10), local.read_exact(&mut request))
		.await
		.expect("request in time")
		.expect("read request");
	assert_eq!(&request, b"hello world");

	local.write_all(b"ok\n").await.expect("send reply");
	let mut reply = [0u8; 3];
	timeout(Duration::from_secs(10), data.read_exact(&mut reply))
		.await
		.expect("reply in time")
		.expect("read reply");
	assert_eq!(&reply, b"ok\n");

	// Hanging up the control channel ends the client session cleanly.
	drop(control_write);
	drop(control_reader);
	let result = timeout(Duration::from_secs(10), client_handle)
		.await
		.expect("client exit in time")
		.expect("no panic");
	assert!(result.is_ok(), "expected a clean session end, got {result:?}");
}

#[tokio::test]
async fn client_exits_on_rejected_secret() {
	let bootstrap_listener = TcpListener::bind("127.0.0.1:0").await.expect("bind bootstrap");
	let bootstrap_port = bootstrap_listener.local_addr().expect("bootstrap addr").port();

	let client_handle = tokio::spawn(client::run(ClientConfig {
		server_ip: "127.0.0.1".to_owned(),
		main_port: bootstrap_port,
		local_port: 1,
		secret: "wrong".to_owned(),
		keep_alive_time: 10,
		buffer_size: 5,
		idle_timeout: 30,
	}));

	let (bootstrap_conn, _) = timeout(Duration::from_secs(10), bootstrap_listener.accept())
		.await
		.expect("bootstrap dial in time")
		.expect("accept bootstrap");
	let (read_half, mut write_half) = bootstrap_conn.into_split();
	let mut reader = BufReader::new(read_half);
	assert_eq!(read_frame(&mut reader).await, b"wrong");

	write_half.write_all(messages::AUTH_REJECT).await.expect("send reject");
	drop(write_half);
	drop(reader);

	let result = timeout(Duration::from_secs(10), client_handle)
		.await
		.expect("client exit in time")
		.expect("no panic");
	assert!(matches!(result, Err(Error::AuthRejected)), "expected auth rejection, got {result:?}");
}
