//! # Factorial Cluster
//! src/lib.rs
//!
//! Planificador distribuido de jobs de factorial entre dos nodos que
//! cooperan por HTTP/1.0: admisión, slots acotados por nodo, una cola de
//! desborde compartida, partición y merge de jobs grandes, agregación
//! ordenada del progreso y cancelación.
//!
//! ## Arquitectura
//!
//! - `http`: Codec HTTP/1.0 (servidor y cliente entre nodos)
//! - `router`: Enrutamiento de requests a handlers
//! - `server`: Servidor TCP, un thread por conexión
//! - `jobs`: Scheduler, executor, cola, coordinador y aggregator
//! - `node`: Arma un nodo completo y expone sus operaciones
//! - `metrics`: Métricas de requests y de admisión
//! - `config` / `error`: Configuración CLI y taxonomía de errores
//!
//! ## Ejemplo de uso
//!
//! ```no_run
//! use factorial_cluster::config::Config;
//! use factorial_cluster::node::Node;
//! use factorial_cluster::server::Server;
//!
//! let config = Config::default();
//! let node = Node::start(&config)?;
//! Server::bind(&config, node)?.run()?;
//! # Ok::<(), factorial_cluster::error::ClusterError>(())
//! ```

pub mod config;
pub mod error;
pub mod http;
pub mod jobs;
pub mod metrics;
pub mod node;
pub mod router;
pub mod server;
