//! # Módulo del Servidor HTTP
//! src/server/mod.rs
//!
//! Servidor TCP del nodo:
//! 1. Escucha en un puerto
//! 2. Acepta conexiones entrantes (un thread por conexión)
//! 3. Lee el request completo y lo enruta al nodo
//! 4. Responde y cierra la conexión

pub mod tcp;

pub use tcp::Server;
