//! # Construcción de Respuestas HTTP
//! src/http/response.rs
//!
//! Builder de respuestas HTTP/1.0. El mismo tipo se usa en la otra
//! dirección: el cliente entre nodos reconstruye la respuesta del peer con
//! [`Response::parse`].
//!
//! ```text
//! HTTP/1.0 200 OK\r\n
//! Content-Type: application/json\r\n
//! Content-Length: 54\r\n
//! X-Node: node1\r\n
//! \r\n
//! {"jobId":"node1-1f","admission":"immediate","parts":[]}
//! ```
//!
//! ```
//! use factorial_cluster::http::{Response, StatusCode};
//!
//! let response = Response::new(StatusCode::Ok)
//!     .with_header("Content-Type", "application/json")
//!     .with_body(r#"{"status": "running"}"#);
//!
//! assert!(response.to_bytes().starts_with(b"HTTP/1.0 200 OK\r\n"));
//! ```

use super::StatusCode;
use crate::error::{ClusterError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;

/// Respuesta HTTP/1.0 completa
#[derive(Debug, Clone)]
pub struct Response {
    status: StatusCode,
    headers: HashMap<String, String>,
    body: Vec<u8>,
}

impl Response {
    /// Respuesta vacía con el código indicado
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HashMap::new(),
            body: Vec::new(),
        }
    }

    /// Agrega (o sobrescribe) un header
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_string(), value.to_string());
        self
    }

    pub fn add_header(&mut self, name: &str, value: &str) {
        self.headers.insert(name.to_string(), value.to_string());
    }

    /// Establece el body y su `Content-Length`
    pub fn with_body(self, body: &str) -> Self {
        self.with_body_bytes(body.as_bytes().to_vec())
    }

    pub fn with_body_bytes(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self.headers
            .insert("Content-Length".to_string(), self.body.len().to_string());
        self
    }

    /// Respuesta 200 con un body JSON ya serializado
    pub fn json(body: &str) -> Self {
        Self::new(StatusCode::Ok)
            .with_header("Content-Type", "application/json")
            .with_body(body)
    }

    /// Serializa `value` como body JSON
    ///
    /// # Ejemplo
    /// ```
    /// use factorial_cluster::http::{Response, StatusCode};
    /// use serde_json::json;
    ///
    /// let response = Response::json_value(StatusCode::Ok, &json!({"length": 3}));
    /// assert_eq!(response.body(), br#"{"length":3}"#);
    /// ```
    pub fn json_value<T: Serialize>(status: StatusCode, value: &T) -> Self {
        match serde_json::to_vec(value) {
            Ok(body) => Self::new(status)
                .with_header("Content-Type", "application/json")
                .with_body_bytes(body),
            Err(e) => Self::error(
                StatusCode::InternalServerError,
                &format!("failed to serialize response: {}", e),
            ),
        }
    }

    /// Respuesta de error con formato `{"error": "mensaje"}`
    pub fn error(status: StatusCode, message: &str) -> Self {
        Self::json_body(status, json!({ "error": message }))
    }

    /// Traduce un [`ClusterError`] a su status y código estable
    ///
    /// Formato: `{"error": "mensaje", "code": "JOB_NOT_FOUND"}`
    pub fn from_error(err: &ClusterError) -> Self {
        match err {
            ClusterError::QueueFull(capacity) => Self::json_body(
                err.status_code(),
                json!({ "error": err.to_string(), "code": err.code(), "capacity": capacity }),
            )
            .with_header("Retry-After", "1"),
            _ => Self::json_body(
                err.status_code(),
                json!({ "error": err.to_string(), "code": err.code() }),
            ),
        }
    }

    fn json_body(status: StatusCode, value: serde_json::Value) -> Self {
        Self::new(status)
            .with_header("Content-Type", "application/json")
            .with_body(&value.to_string())
    }

    /// Serializa la respuesta: status line, headers, línea vacía y body
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut result = Vec::with_capacity(128 + self.body.len());
        result.extend_from_slice(format!("HTTP/1.0 {}\r\n", self.status).as_bytes());
        for (name, value) in &self.headers {
            result.extend_from_slice(format!("{}: {}\r\n", name, value).as_bytes());
        }
        result.extend_from_slice(b"\r\n");
        result.extend_from_slice(&self.body);
        result
    }

    /// Reconstruye una respuesta recibida por el socket
    ///
    /// Se usa del lado cliente cuando un nodo llama al otro. Códigos que no
    /// están en [`StatusCode`] se reportan como error de protocolo.
    pub fn parse(buffer: &[u8]) -> Result<Self> {
        let pos = super::request::header_end(buffer)
            .ok_or_else(|| ClusterError::Protocol("incomplete response head".to_string()))?;
        let head = std::str::from_utf8(&buffer[..pos])
            .map_err(|_| ClusterError::Protocol("response head is not UTF-8".to_string()))?;

        let mut lines = head.split("\r\n");
        let status_line = lines.next().unwrap_or_default();
        let code = status_line
            .split_whitespace()
            .nth(1)
            .and_then(|c| c.parse::<u16>().ok())
            .ok_or_else(|| {
                ClusterError::Protocol(format!("invalid status line: {}", status_line))
            })?;
        let status = StatusCode::from_u16(code)
            .ok_or_else(|| ClusterError::Protocol(format!("unexpected status code {}", code)))?;

        let mut headers = HashMap::new();
        for line in lines {
            if let Some((name, value)) = line.split_once(':') {
                headers.insert(name.trim().to_string(), value.trim().to_string());
            }
        }

        Ok(Self {
            status,
            headers,
            body: buffer[pos + 4..].to_vec(),
        })
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    /// Busca un header sin distinguir mayúsculas
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Deserializa el body JSON
    pub fn json_body_as<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    /// Mensaje de `{"error": ...}` si el body lo trae
    pub fn error_message(&self) -> Option<String> {
        let value: serde_json::Value = serde_json::from_slice(&self.body).ok()?;
        value.get("error")?.as_str().map(str::to_string)
    }
}
