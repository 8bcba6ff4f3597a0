//! # Cliente HTTP entre nodos
//! src/http/client.rs
//!
//! Cliente HTTP/1.0 mínimo sobre `TcpStream`. Una conexión por request: se
//! escribe el request completo, se lee hasta EOF (el servidor cierra la
//! conexión al terminar) y se parsea con [`Response::parse`].
//!
//! Cualquier fallo de conexión, escritura o lectura (incluido el timeout) se
//! reporta como [`ClusterError::PeerUnreachable`], que es la señal que usa el
//! coordinador para caer a ejecución local.

use super::{Method, Response};
use crate::error::{ClusterError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct HttpClient {
    timeout: Duration,
    /// Nombre de este nodo, viaja en `X-Node` para trazabilidad
    node_name: String,
}

impl HttpClient {
    pub fn new(node_name: impl Into<String>, timeout: Duration) -> Self {
        Self {
            timeout,
            node_name: node_name.into(),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Envía un request y devuelve la respuesta cruda, sin mirar el status
    pub fn send(
        &self,
        addr: &str,
        method: Method,
        path: &str,
        body: Option<&[u8]>,
    ) -> Result<Response> {
        let unreachable = |reason: String| ClusterError::PeerUnreachable {
            addr: addr.to_string(),
            reason,
        };

        let socket_addr = addr
            .to_socket_addrs()
            .map_err(|e| unreachable(format!("cannot resolve: {}", e)))?
            .next()
            .ok_or_else(|| unreachable("no address resolved".to_string()))?;

        let mut stream = TcpStream::connect_timeout(&socket_addr, self.timeout)
            .map_err(|e| unreachable(e.to_string()))?;
        stream
            .set_read_timeout(Some(self.timeout))
            .and_then(|_| stream.set_write_timeout(Some(self.timeout)))
            .map_err(|e| unreachable(e.to_string()))?;

        let body = body.unwrap_or_default();
        let mut raw = format!(
            "{} {} HTTP/1.0\r\nHost: {}\r\nX-Node: {}\r\nContent-Length: {}\r\n",
            method.as_str(),
            path,
            addr,
            self.node_name,
            body.len()
        );
        if !body.is_empty() {
            raw.push_str("Content-Type: application/json\r\n");
        }
        raw.push_str("\r\n");

        let mut bytes = raw.into_bytes();
        bytes.extend_from_slice(body);
        stream
            .write_all(&bytes)
            .and_then(|_| stream.flush())
            .map_err(|e| unreachable(e.to_string()))?;

        let mut buffer = Vec::with_capacity(1024);
        stream
            .read_to_end(&mut buffer)
            .map_err(|e| unreachable(e.to_string()))?;

        Response::parse(&buffer)
    }

    /// POST con body JSON; exige un 2xx y deserializa la respuesta
    pub fn post_json<B, R>(&self, addr: &str, path: &str, body: &B) -> Result<R>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let payload = serde_json::to_vec(body)?;
        let response = self.send(addr, Method::POST, path, Some(&payload))?;
        Self::decode(path, response)
    }

    /// GET; exige un 2xx y deserializa la respuesta
    pub fn get_json<R: DeserializeOwned>(&self, addr: &str, path: &str) -> Result<R> {
        let response = self.send(addr, Method::GET, path, None)?;
        Self::decode(path, response)
    }

    fn decode<R: DeserializeOwned>(path: &str, response: Response) -> Result<R> {
        if response.status().is_success() {
            return response.json_body_as();
        }
        let message = response
            .error_message()
            .unwrap_or_else(|| response.status().to_string());
        let body = response.json_body_as::<serde_json::Value>().ok();
        let code = body
            .as_ref()
            .and_then(|v| v.get("code"))
            .and_then(|c| c.as_str());

        Err(match code {
            Some("JOB_NOT_FOUND") => ClusterError::NotFound(message),
            Some("VALIDATION_ERROR") => ClusterError::Validation(message),
            Some("QUEUE_FULL") => ClusterError::QueueFull(
                body.as_ref()
                    .and_then(|v| v.get("capacity"))
                    .and_then(|c| c.as_u64())
                    .unwrap_or(0) as usize,
            ),
            _ => ClusterError::Protocol(format!(
                "{} answered {}: {}",
                path,
                response.status(),
                message
            )),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::StatusCode;
    use serde_json::json;
    use std::net::TcpListener;
    use std::thread;

    /// Servidor de una sola conexión que responde `response`
    fn one_shot(response: Response) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 4096];
            let _ = stream.read(&mut buf).unwrap();
            stream.write_all(&response.to_bytes()).unwrap();
        });
        addr
    }

    #[test]
    fn test_post_json_success() {
        let addr = one_shot(Response::json_value(StatusCode::Ok, &json!({"accepted": true})));
        let client = HttpClient::new("node1", Duration::from_secs(2));

        let reply: serde_json::Value = client
            .post_json(&addr, "/peer/dispatch", &json!({"partId": "a_part2"}))
            .unwrap();
        assert_eq!(reply["accepted"], true);
    }

    #[test]
    fn test_not_found_maps_to_not_found() {
        let addr = one_shot(Response::from_error(&ClusterError::NotFound("x".into())));
        let client = HttpClient::new("node1", Duration::from_secs(2));

        let result: Result<serde_json::Value> = client.get_json(&addr, "/jobs/progress?id=x");
        assert!(matches!(result, Err(ClusterError::NotFound(_))));
    }

    #[test]
    fn test_connection_refused_is_peer_unreachable() {
        // Puerto recién liberado: nadie escucha ahí
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().to_string()
        };
        let client = HttpClient::new("node1", Duration::from_millis(300));

        let result: Result<serde_json::Value> = client.get_json(&addr, "/status");
        let err = result.unwrap_err();
        assert!(matches!(err, ClusterError::PeerUnreachable { .. }));
        assert!(err.is_transient());
    }
}
