//! # Parsing de Requests HTTP/1.0
//! src/http/request.rs
//!
//! Parser de requests que usan los clientes (submit, progress, cancel) y el
//! otro nodo (dispatch, callback, cola compartida).
//!
//! ```text
//! POST /jobs/submit HTTP/1.0\r\n
//! Content-Type: application/json\r\n
//! Content-Length: 19\r\n
//! \r\n
//! {"targetNumber": 5}
//! ```

use crate::error::ClusterError;
use serde::de::DeserializeOwned;
use std::collections::HashMap;

/// Métodos HTTP soportados
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    GET,
    POST,
}

impl Method {
    fn from_str(s: &str) -> Result<Self, ParseError> {
        match s {
            "GET" => Ok(Method::GET),
            "POST" => Ok(Method::POST),
            _ => Err(ParseError::UnsupportedMethod(s.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::GET => "GET",
            Method::POST => "POST",
        }
    }
}

/// Request HTTP/1.0 parseado
#[derive(Debug, Clone)]
pub struct Request {
    method: Method,
    path: String,
    query_params: HashMap<String, String>,
    /// Headers con el nombre normalizado a minúsculas
    headers: HashMap<String, String>,
    body: Vec<u8>,
}

/// Errores que pueden ocurrir durante el parsing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    InvalidRequestLine,
    UnsupportedMethod(String),
    InvalidHttpVersion(String),
    InvalidHeader(String),
    EmptyRequest,
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParseError::InvalidRequestLine => write!(f, "Invalid request line format"),
            ParseError::UnsupportedMethod(m) => write!(f, "Unsupported HTTP method: {}", m),
            ParseError::InvalidHttpVersion(v) => write!(f, "Invalid HTTP version: {}", v),
            ParseError::InvalidHeader(h) => write!(f, "Invalid header: {}", h),
            ParseError::EmptyRequest => write!(f, "Empty request"),
        }
    }
}

impl std::error::Error for ParseError {}

/// Posición donde termina el bloque de headers (`\r\n\r\n`), si ya llegó completo
pub(crate) fn header_end(buffer: &[u8]) -> Option<usize> {
    buffer.windows(4).position(|w| w == b"\r\n\r\n")
}

impl Request {
    /// Parsea un request HTTP/1.0 desde bytes
    ///
    /// # Ejemplo
    ///
    /// ```
    /// use factorial_cluster::http::Request;
    ///
    /// let raw = b"GET /jobs/progress?id=node1-7 HTTP/1.0\r\n\r\n";
    /// let request = Request::parse(raw).unwrap();
    ///
    /// assert_eq!(request.path(), "/jobs/progress");
    /// assert_eq!(request.query_param("id"), Some("node1-7"));
    /// ```
    pub fn parse(buffer: &[u8]) -> Result<Self, ParseError> {
        // El body puede ser binario; solo la cabecera tiene que ser UTF-8
        let (head, body) = match header_end(buffer) {
            Some(pos) => (&buffer[..pos], buffer[pos + 4..].to_vec()),
            None => (buffer, Vec::new()),
        };

        let head = std::str::from_utf8(head).map_err(|_| ParseError::InvalidRequestLine)?;
        if head.trim().is_empty() {
            return Err(ParseError::EmptyRequest);
        }

        let mut lines = head.split("\r\n");
        let request_line = lines.next().ok_or(ParseError::EmptyRequest)?;
        let (method, path, query_params) = Self::parse_request_line(request_line)?;
        let headers = Self::parse_headers(lines)?;

        Ok(Request {
            method,
            path,
            query_params,
            headers,
            body,
        })
    }

    /// Formato: `POST /path?query HTTP/1.0`
    fn parse_request_line(
        line: &str,
    ) -> Result<(Method, String, HashMap<String, String>), ParseError> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() != 3 {
            return Err(ParseError::InvalidRequestLine);
        }

        let method = Method::from_str(parts[0])?;
        let (path, query_params) = Self::parse_path_and_query(parts[1]);

        let version = parts[2];
        if version != "HTTP/1.0" && version != "HTTP/1.1" {
            return Err(ParseError::InvalidHttpVersion(version.to_string()));
        }

        Ok((method, path, query_params))
    }

    fn parse_path_and_query(path_with_query: &str) -> (String, HashMap<String, String>) {
        match path_with_query.split_once('?') {
            Some((path, query)) => (path.to_string(), Self::parse_query_string(query)),
            None => (path_with_query.to_string(), HashMap::new()),
        }
    }

    fn parse_query_string(query: &str) -> HashMap<String, String> {
        query
            .split('&')
            .filter(|param| !param.is_empty())
            .map(|param| match param.split_once('=') {
                Some((key, value)) => (key.to_string(), Self::url_decode(value)),
                None => (param.to_string(), String::new()),
            })
            .collect()
    }

    /// Decodificación mínima: `+` y secuencias `%XX`
    fn url_decode(s: &str) -> String {
        let bytes = s.as_bytes();
        let mut out = Vec::with_capacity(bytes.len());
        let mut i = 0;
        while i < bytes.len() {
            match bytes[i] {
                b'+' => out.push(b' '),
                b'%' if i + 2 < bytes.len() => {
                    let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).unwrap_or("");
                    match u8::from_str_radix(hex, 16) {
                        Ok(b) => {
                            out.push(b);
                            i += 2;
                        }
                        Err(_) => out.push(b'%'),
                    }
                }
                b => out.push(b),
            }
            i += 1;
        }
        String::from_utf8_lossy(&out).into_owned()
    }

    fn parse_headers<'a>(
        lines: impl Iterator<Item = &'a str>,
    ) -> Result<HashMap<String, String>, ParseError> {
        let mut headers = HashMap::new();
        for line in lines {
            if line.trim().is_empty() {
                break;
            }
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| ParseError::InvalidHeader(line.to_string()))?;
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
        }
        Ok(headers)
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn query_params(&self) -> &HashMap<String, String> {
        &self.query_params
    }

    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query_params.get(name).map(|s| s.as_str())
    }

    /// Busca un header sin distinguir mayúsculas
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(|s| s.as_str())
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Deserializa el body JSON
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, ClusterError> {
        if self.body.is_empty() {
            return Err(ClusterError::Validation("missing JSON body".to_string()));
        }
        Ok(serde_json::from_slice(&self.body)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[test]
    fn test_parse_get_with_query() {
        let raw = b"GET /jobs/progress?id=abc&forwarded=1 HTTP/1.0\r\nHost: x\r\n\r\n";
        let request = Request::parse(raw).unwrap();

        assert_eq!(request.method(), Method::GET);
        assert_eq!(request.path(), "/jobs/progress");
        assert_eq!(request.query_param("id"), Some("abc"));
        assert_eq!(request.query_param("forwarded"), Some("1"));
        assert!(request.body().is_empty());
    }

    #[test]
    fn test_parse_post_json_body() {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Submit {
            target_number: i64,
        }

        let raw = b"POST /jobs/submit HTTP/1.0\r\nContent-Type: application/json\r\nContent-Length: 19\r\n\r\n{\"targetNumber\": 5}";
        let request = Request::parse(raw).unwrap();

        assert_eq!(request.method(), Method::POST);
        assert_eq!(request.header("content-length"), Some("19"));
        assert_eq!(request.header("Content-Type"), Some("application/json"));
        let submit: Submit = request.json().unwrap();
        assert_eq!(submit.target_number, 5);
    }

    #[test]
    fn test_json_missing_body_is_validation_error() {
        let request = Request::parse(b"POST /jobs/cancel HTTP/1.0\r\n\r\n").unwrap();
        let result: Result<serde_json::Value, _> = request.json();
        assert!(matches!(result, Err(ClusterError::Validation(_))));
    }

    #[test]
    fn test_url_decode() {
        let request = Request::parse(b"GET /x?a=hello%20world&b=1+2 HTTP/1.0\r\n\r\n").unwrap();
        assert_eq!(request.query_param("a"), Some("hello world"));
        assert_eq!(request.query_param("b"), Some("1 2"));
    }

    #[test]
    fn test_invalid_requests() {
        assert_eq!(Request::parse(b"").unwrap_err(), ParseError::EmptyRequest);
        assert_eq!(
            Request::parse(b"GET /\r\n\r\n").unwrap_err(),
            ParseError::InvalidRequestLine
        );
        assert_eq!(
            Request::parse(b"DELETE / HTTP/1.0\r\n\r\n").unwrap_err(),
            ParseError::UnsupportedMethod("DELETE".to_string())
        );
        assert_eq!(
            Request::parse(b"GET / HTTP/2.0\r\n\r\n").unwrap_err(),
            ParseError::InvalidHttpVersion("HTTP/2.0".to_string())
        );
        assert!(matches!(
            Request::parse(b"GET / HTTP/1.0\r\nbroken header\r\n\r\n"),
            Err(ParseError::InvalidHeader(_))
        ));
    }
}
