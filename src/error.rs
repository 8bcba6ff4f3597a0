//! # Errores del Cluster
//! src/error.rs
//!
//! Taxonomía de errores del planificador. Cada variante corresponde a una
//! política distinta: las validaciones se rechazan antes de admitir, los
//! fallos del peer se recuperan localmente, los fallos del executor y del
//! merge terminan el job en `Failed`, y los fallos de escritura se reintentan.

use crate::http::StatusCode;

/// Error del planificador de jobs
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    /// Entrada fuera de rango (se rechaza antes de admitir, no se reintenta)
    #[error("validation error: {0}")]
    Validation(String),

    /// El nodo peer no respondió (timeout o conexión rechazada)
    #[error("peer unreachable at {addr}: {reason}")]
    PeerUnreachable { addr: String, reason: String },

    /// El executor no pudo construirse o falló internamente
    #[error("executor fault: {0}")]
    ExecutorFault(String),

    /// Resultado parcial faltante o corrupto al combinar partes
    #[error("merge inconsistency: {0}")]
    MergeInconsistency(String),

    /// Falló la escritura del registro del job
    #[error("persistence write failed: {0}")]
    PersistenceWrite(String),

    #[error("job not found: {0}")]
    NotFound(String),

    /// La cola compartida alcanzó su capacidad máxima
    #[error("overflow queue is full (max capacity: {0})")]
    QueueFull(usize),

    /// Respuesta inesperada del otro nodo
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ClusterError>;

impl ClusterError {
    /// Código estable que viaja en el body de las respuestas de error
    pub fn code(&self) -> &'static str {
        match self {
            ClusterError::Validation(_) => "VALIDATION_ERROR",
            ClusterError::PeerUnreachable { .. } => "PEER_UNREACHABLE",
            ClusterError::ExecutorFault(_) => "EXECUTOR_FAULT",
            ClusterError::MergeInconsistency(_) => "MERGE_INCONSISTENCY",
            ClusterError::PersistenceWrite(_) => "PERSISTENCE_WRITE_ERROR",
            ClusterError::NotFound(_) => "JOB_NOT_FOUND",
            ClusterError::QueueFull(_) => "QUEUE_FULL",
            ClusterError::Protocol(_) => "PROTOCOL_ERROR",
            ClusterError::Config(_) => "CONFIG_ERROR",
            ClusterError::Io(_) => "IO_ERROR",
            ClusterError::Json(_) => "INVALID_JSON",
        }
    }

    /// Status HTTP con el que se reporta el error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ClusterError::Validation(_) | ClusterError::Json(_) => StatusCode::BadRequest,
            ClusterError::NotFound(_) => StatusCode::NotFound,
            ClusterError::QueueFull(_) => StatusCode::ServiceUnavailable,
            ClusterError::PeerUnreachable { .. } => StatusCode::BadGateway,
            _ => StatusCode::InternalServerError,
        }
    }

    /// Los errores transitorios se reintentan en el flush del aggregator
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ClusterError::PeerUnreachable { .. }
                | ClusterError::PersistenceWrite(_)
                | ClusterError::Io(_)
                | ClusterError::Protocol(_)
        )
    }
}
