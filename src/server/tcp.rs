//! # Servidor TCP Concurrente
//! src/server/tcp.rs
//!
//! Servidor HTTP/1.0 del nodo. Cada conexión se procesa en su propio thread:
//! se lee el request completo (headers + `Content-Length` bytes de body), se
//! enruta hacia el [`Node`] y se cierra la conexión tras responder.

use crate::config::Config;
use crate::error::Result;
use crate::http::request::header_end;
use crate::http::{Request, Response, StatusCode};
use crate::jobs::handlers;
use crate::node::Node;
use crate::router::Router;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime};

/// Tamaño máximo aceptado para un request
const MAX_REQUEST_BYTES: usize = 1024 * 1024;

/// Timeout de lectura por conexión
const READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Servidor HTTP/1.0 de un nodo
pub struct Server {
    node: Arc<Node>,
    router: Arc<Router<Node>>,
    listener: TcpListener,
}

impl Server {
    /// Hace bind en la dirección configurada
    pub fn bind(config: &Config, node: Arc<Node>) -> Result<Self> {
        let listener = TcpListener::bind(config.address())?;
        Ok(Self::from_listener(node, listener))
    }

    /// Usa un listener ya abierto (puerto efímero en tests)
    pub fn from_listener(node: Arc<Node>, listener: TcpListener) -> Self {
        Self {
            node,
            router: Arc::new(handlers::routes()),
            listener,
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Acepta conexiones indefinidamente, un thread por conexión
    pub fn run(self) -> Result<()> {
        let address = self.local_addr()?;
        tracing::info!(
            node = %self.node.name(),
            address = %address,
            routes = self.router.len(),
            "listening (one thread per connection)"
        );

        for stream in self.listener.incoming() {
            match stream {
                Ok(stream) => self.dispatch(stream),
                Err(e) => tracing::warn!(error = %e, "failed to accept connection"),
            }
        }
        Ok(())
    }

    /// Corre el servidor en un thread propio
    pub fn spawn(self) -> Result<JoinHandle<()>> {
        let name = format!("http-{}", self.node.name());
        let handle = thread::Builder::new().name(name).spawn(move || {
            if let Err(e) = self.run() {
                tracing::error!(error = %e, "server stopped");
            }
        })?;
        Ok(handle)
    }

    fn dispatch(&self, stream: TcpStream) {
        let node = Arc::clone(&self.node);
        let router = Arc::clone(&self.router);
        let metrics = node.metrics().clone();

        metrics.increment_active_threads();
        let spawned = thread::Builder::new()
            .name("conn".to_string())
            .spawn(move || {
                if let Err(e) = handle_connection(stream, &router, &node) {
                    tracing::debug!(error = %e, "connection error");
                }
                node.metrics().decrement_active_threads();
            });
        if let Err(e) = spawned {
            tracing::error!(error = %e, "cannot spawn connection thread");
            metrics.decrement_active_threads();
        }
    }
}

fn request_id() -> String {
    let mut hasher = DefaultHasher::new();
    SystemTime::now().hash(&mut hasher);
    thread::current().id().hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

/// Lee headers y luego exactamente `Content-Length` bytes de body
fn read_request(stream: &mut TcpStream) -> std::io::Result<Vec<u8>> {
    let mut buffer = Vec::with_capacity(1024);
    let mut chunk = [0u8; 4096];

    let body_start = loop {
        if let Some(pos) = header_end(&buffer) {
            break pos + 4;
        }
        let n = stream.read(&mut chunk)?;
        if n == 0 {
            return Ok(buffer);
        }
        buffer.extend_from_slice(&chunk[..n]);
        if buffer.len() > MAX_REQUEST_BYTES {
            return Ok(buffer);
        }
    };

    let head = String::from_utf8_lossy(&buffer[..body_start]).to_string();
    let content_length = head
        .lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse::<usize>().ok())
        .unwrap_or(0)
        .min(MAX_REQUEST_BYTES);

    while buffer.len() < body_start + content_length {
        let n = stream.read(&mut chunk)?;
        if n == 0 {
            break;
        }
        buffer.extend_from_slice(&chunk[..n]);
    }
    Ok(buffer)
}

fn handle_connection(mut stream: TcpStream, router: &Router<Node>, node: &Node) -> std::io::Result<()> {
    let start = Instant::now();
    let request_id = request_id();
    let thread_id = format!("{:?}", thread::current().id());
    stream.set_read_timeout(Some(READ_TIMEOUT))?;

    let buffer = read_request(&mut stream)?;
    if buffer.is_empty() {
        return Ok(());
    }

    let (mut response, path) = match Request::parse(&buffer) {
        Ok(request) => {
            let path = request.path().to_string();
            (router.route(&request, node), path)
        }
        Err(e) => {
            tracing::debug!(request_id = %request_id, error = %e, "unparseable request");
            (
                Response::error(StatusCode::BadRequest, &format!("Invalid: {}", e)),
                "/error".to_string(),
            )
        }
    };

    response.add_header("X-Request-Id", &request_id);
    response.add_header("X-Node", node.name());
    response.add_header("X-Worker-Thread", &thread_id);

    stream.write_all(&response.to_bytes())?;
    stream.flush()?;

    let latency = start.elapsed();
    let status = response.status().as_u16();
    node.metrics().record_request(&path, status, latency);
    tracing::debug!(
        request_id = %request_id,
        path = %path,
        status,
        latency_us = latency.as_micros() as u64,
        "request served"
    );
    Ok(())
}
