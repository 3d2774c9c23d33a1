//! Command-line options for the two tunnel endpoints.

/// Options for the publicly reachable tunnel server.
#[derive(clap::Parser, Debug, Clone)]
#[command(name = "tunnel-server", version, about = "Publicly reachable half of the reverse tunnel")]
pub struct ServerConfig {
	/// Port the bootstrap listener binds on, e.g. `11234`.
	#[arg(long, default_value_t = 11234)]
	pub main_port: u16,
	/// Shared secret clients must present when connecting.
	#[arg(long, default_value = "secret")]
	pub secret: String,
	/// Seconds between heartbeat frames on the control channel.
	#[arg(long, default_value_t = 10)]
	pub keep_alive_time: u64,
	/// Capacity of the pending-connection and notification queues.
	#[arg(long, default_value_t = 100)]
	pub conn_chan_count: usize,
	/// Relay copy buffer size in KiB.
	#[arg(long, default_value_t = 5)]
	pub buffer_size: usize,
	/// Seconds a relayed pair may stay silent before both halves are closed.
	#[arg(long, default_value_t = 30)]
	pub idle_timeout: u64,
}

/// Options for the tunnel client running next to the local service.
#[derive(clap::Parser, Debug, Clone)]
#[command(name = "tunnel-client", version, about = "NAT-side half of the reverse tunnel")]
pub struct ClientConfig {
	/// Address of the tunnel server, e.g. `example.com`.
	#[arg(long, default_value = "127.0.0.1")]
	pub server_ip: String,
	/// Bootstrap port of the tunnel server.
	#[arg(long, default_value_t = 11234)]
	pub main_port: u16,
	/// Port of the local TCP service to expose, e.g. `8080`.
	#[arg(long)]
	pub local_port: u16,
	/// Shared secret to present to the server.
	#[arg(long, default_value = "secret")]
	pub secret: String,
	/// Seconds between heartbeat frames on the control channel.
	#[arg(long, default_value_t = 10)]
	pub keep_alive_time: u64,
	/// Relay copy buffer size in KiB.
	#[arg(long, default_value_t = 5)]
	pub buffer_size: usize,
	/// Seconds a relayed pair may stay silent before both halves are closed.
	#[arg(long, default_value_t = 30)]
	pub idle_timeout: u64,
}
