//! # Factorial Cluster Node - Entry Point
//! src/main.rs
//!
//! Punto de entrada de un nodo del cluster.
//!
//! ## Uso
//! ```bash
//! factorial_node --help
//! factorial_node --node-name node1 --port 8001 --peer 127.0.0.1:8002
//! RUST_LOG=debug factorial_node --in-memory
//! ```

use anyhow::Context;
use factorial_cluster::config::Config;
use factorial_cluster::node::Node;
use factorial_cluster::server::Server;
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    println!("=================================");
    println!("  Factorial Cluster Node");
    println!("  Principios de Sistemas Operativos");
    println!("=================================\n");

    // Parsear configuración desde CLI y env vars
    let config = Config::new();
    config.validate().context("invalid configuration")?;
    config.print_summary();

    let node = Node::start(&config).context("failed to start node")?;
    let server = Server::bind(&config, node)
        .with_context(|| format!("cannot listen on {}", config.address()))?;

    server.run().context("server stopped")?;
    Ok(())
}
