//! # Configuración del Nodo
//! src/config.rs
//!
//! Configuración de un nodo del cluster con soporte para argumentos CLI y
//! variables de entorno.
//!
//! ## Ejemplos de uso
//!
//! ### CLI (dos nodos en la misma máquina)
//! ```bash
//! ./factorial_node --node-name node1 --port 8001 --peer 127.0.0.1:8002
//! ./factorial_node --node-name node2 --port 8002 --peer 127.0.0.1:8001 \
//!   --queue-host 127.0.0.1:8001
//! ```
//!
//! ### Variables de entorno
//! ```bash
//! NODE_NAME=node2 NODE_PORT=8002 PEER_ADDR=10.0.0.1:8001 ./factorial_node
//! ```

use crate::error::{ClusterError, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

/// Mayor número cuyo factorial se acepta
pub const MAX_TARGET: u64 = 170;

/// Configuración de un nodo
#[derive(Debug, Clone, Parser)]
#[command(name = "factorial_node")]
#[command(about = "Nodo del planificador distribuido de jobs de factorial")]
#[command(version = "0.1.0")]
pub struct Config {
    /// Puerto en el que escucha el nodo (0 = efímero)
    #[arg(short, long, default_value = "8001", env = "NODE_PORT")]
    pub port: u16,

    /// Host/IP en el que escucha
    #[arg(long, default_value = "127.0.0.1", env = "NODE_HOST")]
    pub host: String,

    /// Nombre del nodo (aparece como ownerNode / assignedNode)
    #[arg(long = "node-name", default_value = "node1", env = "NODE_NAME")]
    pub node_name: String,

    /// Dirección que se entrega al peer para los callbacks (por defecto host:port)
    #[arg(long, env = "NODE_ADVERTISE")]
    pub advertise: Option<String>,

    // === Cluster ===
    /// host:port del nodo que coopera con este
    #[arg(long = "peer", env = "PEER_ADDR")]
    pub peer_addr: Option<String>,

    /// host:port del nodo que aloja la cola compartida (vacío = este nodo)
    #[arg(long = "queue-host", env = "QUEUE_HOST")]
    pub queue_host: Option<String>,

    // === Scheduler ===
    /// Slots de ejecución concurrente en este nodo
    #[arg(long = "max-concurrent", default_value = "2", env = "MAX_CONCURRENT")]
    pub max_concurrent: usize,

    /// Capacidad de la cola compartida cuando este nodo la aloja
    #[arg(long = "queue-capacity", default_value = "1000", env = "QUEUE_CAPACITY")]
    pub queue_capacity: usize,

    /// Números mayores a este umbral se reparten entre los dos nodos
    #[arg(
        long = "distribution-threshold",
        default_value = "70",
        env = "DISTRIBUTION_THRESHOLD"
    )]
    pub distribution_threshold: u64,

    /// Intervalo del drenado periódico de la cola
    #[arg(long = "drain-interval-ms", default_value = "1000", env = "DRAIN_INTERVAL_MS")]
    pub drain_interval_ms: u64,

    /// Gracia antes de forzar la terminación de un job cancelado
    #[arg(long = "cancel-grace-ms", default_value = "500", env = "CANCEL_GRACE_MS")]
    pub cancel_grace_ms: u64,

    // === Executor ===
    /// Pausa entre multiplicaciones
    #[arg(long = "step-delay-ms", default_value = "100", env = "STEP_DELAY_MS")]
    pub step_delay_ms: u64,

    /// Pausa antes del checkpoint de setup
    #[arg(long = "setup-delay-ms", default_value = "1000", env = "SETUP_DELAY_MS")]
    pub setup_delay_ms: u64,

    // === RPC / Aggregator ===
    /// Timeout de conexión, lectura y escritura hacia el peer
    #[arg(long = "peer-timeout-ms", default_value = "3000", env = "PEER_TIMEOUT_MS")]
    pub peer_timeout_ms: u64,

    /// Intentos por update de progreso antes de descartarlo (los finales se reintentan siempre)
    #[arg(long = "flush-retries", default_value = "5", env = "FLUSH_RETRIES")]
    pub flush_retries: u32,

    /// Pausa entre intentos de un update
    #[arg(
        long = "flush-retry-delay-ms",
        default_value = "200",
        env = "FLUSH_RETRY_DELAY_MS"
    )]
    pub flush_retry_delay_ms: u64,

    // === Storage ===
    /// Archivo JSON de registros de jobs (por defecto ./data/<node>-jobs.json)
    #[arg(long = "jobs-storage", env = "JOBS_STORAGE")]
    pub jobs_storage_path: Option<String>,

    /// Mantener los registros solo en memoria
    #[arg(long = "in-memory", env = "JOBS_IN_MEMORY")]
    pub in_memory: bool,
}

impl Config {
    /// Parsea argumentos CLI y variables de entorno
    pub fn new() -> Self {
        Config::parse()
    }

    /// Dirección de bind (host:port)
    ///
    /// # Ejemplo
    /// ```rust
    /// use factorial_cluster::config::Config;
    ///
    /// let config = Config::default();
    /// assert_eq!(config.address(), "127.0.0.1:8001");
    /// ```
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Dirección con la que el peer nos contacta
    pub fn advertised_address(&self) -> String {
        self.advertise.clone().unwrap_or_else(|| self.address())
    }

    pub fn storage_path(&self) -> PathBuf {
        match &self.jobs_storage_path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(format!("./data/{}-jobs.json", self.node_name)),
        }
    }

    pub fn peer_timeout(&self) -> Duration {
        Duration::from_millis(self.peer_timeout_ms)
    }

    /// Valida la configuración
    pub fn validate(&self) -> Result<()> {
        if self.node_name.trim().is_empty() {
            return Err(ClusterError::Config("node name must not be empty".to_string()));
        }
        if self.max_concurrent == 0 {
            return Err(ClusterError::Config("max concurrent must be >= 1".to_string()));
        }
        if self.queue_capacity == 0 {
            return Err(ClusterError::Config("queue capacity must be >= 1".to_string()));
        }
        if self.distribution_threshold == 0 || self.distribution_threshold > MAX_TARGET {
            return Err(ClusterError::Config(format!(
                "distribution threshold must be 1-{}",
                MAX_TARGET
            )));
        }
        if self.peer_timeout_ms == 0 {
            return Err(ClusterError::Config("peer timeout must be > 0".to_string()));
        }
        if self.drain_interval_ms == 0 {
            return Err(ClusterError::Config("drain interval must be > 0".to_string()));
        }

        let own = self.advertised_address();
        if self.peer_addr.as_deref() == Some(own.as_str()) {
            return Err(ClusterError::Config(format!(
                "peer address {} points at this node",
                own
            )));
        }
        if self.queue_host.as_deref() == Some(own.as_str()) {
            return Err(ClusterError::Config(format!(
                "queue host {} points at this node; omit --queue-host to host it locally",
                own
            )));
        }

        Ok(())
    }

    /// Imprime un resumen de la configuración
    pub fn print_summary(&self) {
        println!("╔══════════════════════════════════════════════════════════════╗");
        println!("║            Factorial Cluster Node Configuration              ║");
        println!("╚══════════════════════════════════════════════════════════════╝");
        println!();
        println!("🌐 Network:");
        println!("   Node:         {}", self.node_name);
        println!("   Address:      {}", self.address());
        println!("   Advertised:   {}", self.advertised_address());
        println!(
            "   Peer:         {}",
            self.peer_addr.as_deref().unwrap_or("none (all parts run locally)")
        );
        println!(
            "   Queue host:   {}",
            self.queue_host.as_deref().unwrap_or("this node")
        );
        println!();
        println!("👷 Scheduler:");
        println!("   ┌────────────────────────┬──────────────┐");
        println!("   │ Slots                  │ {:>12} │", self.max_concurrent);
        println!("   │ Queue capacity         │ {:>12} │", self.queue_capacity);
        println!("   │ Distribution threshold │ {:>12} │", self.distribution_threshold);
        println!("   │ Drain interval         │ {:>9} ms │", self.drain_interval_ms);
        println!("   │ Cancel grace           │ {:>9} ms │", self.cancel_grace_ms);
        println!("   │ Step delay             │ {:>9} ms │", self.step_delay_ms);
        println!("   └────────────────────────┴──────────────┘");
        println!();
        println!("💾 Storage:");
        if self.in_memory {
            println!("   Records:      in memory");
        } else {
            println!("   Records:      {}", self.storage_path().display());
        }
        println!(
            "   Flush:        {} retries, {} ms apart",
            self.flush_retries, self.flush_retry_delay_ms
        );
        println!();
        println!("═══════════════════════════════════════════════════════════════");
        println!();
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8001,
            host: "127.0.0.1".to_string(),
            node_name: "node1".to_string(),
            advertise: None,
            peer_addr: None,
            queue_host: None,
            max_concurrent: 2,
            queue_capacity: 1000,
            distribution_threshold: 70,
            drain_interval_ms: 1000,
            cancel_grace_ms: 500,
            step_delay_ms: 100,
            setup_delay_ms: 1000,
            peer_timeout_ms: 3000,
            flush_retries: 5,
            flush_retry_delay_ms: 200,
            jobs_storage_path: None,
            in_memory: false,
        }
    }
}
