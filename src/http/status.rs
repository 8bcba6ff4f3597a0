//! # Códigos de Estado HTTP
//!
//! Códigos que usan tanto los endpoints públicos (submit, progress, cancel)
//! como el protocolo entre nodos. El cliente interno los reconstruye desde
//! la status line con [`StatusCode::from_u16`].

/// Códigos de estado HTTP que emite o entiende el nodo
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    /// 200 OK - La petición fue exitosa
    Ok = 200,

    /// 400 Bad Request - Número fuera de rango, JSON inválido, parámetro faltante
    BadRequest = 400,

    /// 404 Not Found - Ruta o job inexistente
    NotFound = 404,

    /// 405 Method Not Allowed - La ruta existe con otro método
    MethodNotAllowed = 405,

    /// 409 Conflict - El recurso no está en un estado compatible
    Conflict = 409,

    /// 500 Internal Server Error
    InternalServerError = 500,

    /// 502 Bad Gateway - El nodo peer no respondió
    BadGateway = 502,

    /// 503 Service Unavailable - Cola compartida llena
    ServiceUnavailable = 503,
}

impl StatusCode {
    /// Convierte el código a su valor numérico
    ///
    /// # Ejemplo
    /// ```
    /// use factorial_cluster::http::StatusCode;
    /// assert_eq!(StatusCode::Ok.as_u16(), 200);
    /// ```
    pub fn as_u16(&self) -> u16 {
        *self as u16
    }

    /// Reconstruye el código a partir del valor numérico de una status line
    pub fn from_u16(code: u16) -> Option<Self> {
        match code {
            200 => Some(StatusCode::Ok),
            400 => Some(StatusCode::BadRequest),
            404 => Some(StatusCode::NotFound),
            405 => Some(StatusCode::MethodNotAllowed),
            409 => Some(StatusCode::Conflict),
            500 => Some(StatusCode::InternalServerError),
            502 => Some(StatusCode::BadGateway),
            503 => Some(StatusCode::ServiceUnavailable),
            _ => None,
        }
    }

    /// Texto de razón (reason phrase) del RFC 1945
    pub fn reason_phrase(&self) -> &'static str {
        match self {
            StatusCode::Ok => "OK",
            StatusCode::BadRequest => "Bad Request",
            StatusCode::NotFound => "Not Found",
            StatusCode::MethodNotAllowed => "Method Not Allowed",
            StatusCode::Conflict => "Conflict",
            StatusCode::InternalServerError => "Internal Server Error",
            StatusCode::BadGateway => "Bad Gateway",
            StatusCode::ServiceUnavailable => "Service Unavailable",
        }
    }

    /// Verifica si el código indica éxito (2xx)
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.as_u16())
    }

    /// Verifica si el código indica error del cliente (4xx)
    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.as_u16())
    }

    /// Verifica si el código indica error del servidor (5xx)
    pub fn is_server_error(&self) -> bool {
        (500..600).contains(&self.as_u16())
    }
}

impl std::fmt::Display for StatusCode {
    /// Formato: "200 OK"
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.as_u16(), self.reason_phrase())
    }
}
