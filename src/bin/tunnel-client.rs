//! NAT-side half of the tunnel: dials out to the server and exposes a local
//! TCP service through it.

use anyhow::Context;
use clap::Parser;
use reverse_tunnel::client;
use reverse_tunnel::config::ClientConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	env_logger::init();
	let config = ClientConfig::parse();

	client::run(config).await.context("Running the tunnel client")
}
