//! Publicly reachable half of the tunnel: issues session ports to
//! authenticated clients and forwards public connections through them.

use anyhow::Context;
use clap::Parser;
use reverse_tunnel::config::ServerConfig;
use reverse_tunnel::server::Server;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	env_logger::init();
	let config = ServerConfig::parse();

	let server = Server::bind(config).await.context("Binding the bootstrap listener")?;
	log::info!("Waiting for tunnel clients on {}", server.local_addr().context("Reading the bootstrap listener address")?);
	server.run().await.context("Running the bootstrap accept loop")
}
