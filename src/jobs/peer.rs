//! # Protocolo entre Nodos
//! src/jobs/peer.rs
//!
//! Mensajes JSON que intercambian los dos nodos y el cliente que los envía.
//! Cada llamada abre una conexión con el timeout configurado; cualquier
//! fallo de red llega como [`ClusterError::PeerUnreachable`].
//!
//! | Endpoint | Request | Response |
//! |---|---|---|
//! | `POST /peer/dispatch` | [`PartDispatch`] | [`DispatchAck`] |
//! | `POST /peer/callback` | [`UpdateCallback`] | [`CallbackAck`] |
//! | `POST /peer/cancel` | [`CancelRequest`] | [`CancelAck`] |
//! | `GET /jobs/progress?forwarded=1` | | [`ProgressView`] |
//! | `POST /jobs/cancel?forwarded=1` | [`CancelRequest`] | [`CancelResponse`] |

use crate::error::Result;
use crate::http::HttpClient;
use crate::jobs::types::{BigValue, FactorRange, JobStatus, JobUpdate, ProgressView};
use serde::{Deserialize, Serialize};

/// Parte de un job distribuido enviada al peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartDispatch {
    pub part_id: String,
    pub range: FactorRange,
    pub seed: BigValue,
    pub parent_job_id: String,
    /// Dirección del coordinador, donde el peer reporta cada update
    pub callback_address: String,
    pub origin_node: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchAck {
    pub accepted: bool,
    /// `immediate` o `queued`
    pub admission: String,
    pub position: Option<usize>,
    pub node: String,
}

/// Update de un job cuyo registro vive en el nodo que recibe el callback
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateCallback {
    pub job_id: String,
    pub parent_job_id: Option<String>,
    /// Dirección del nodo cuyo executor produjo el update
    pub sender: String,
    pub update: JobUpdate,
}

/// `accepted: false` si el dueño ya reasignó el job a otro nodo
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallbackAck {
    pub accepted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelRequest {
    pub job_id: String,
}

/// Qué hizo el scheduler de un nodo con una cancelación
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    /// Estaba en la cola (o backlog) y se quitó sin ejecutarse
    Removed,
    /// Estaba ejecutándose; se activó su token
    Signalled,
    /// Este nodo no lo tiene
    NotHere,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelAck {
    pub job_id: String,
    pub outcome: CancelOutcome,
}

/// Respuesta de `POST /jobs/cancel`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelResponse {
    pub job_id: String,
    pub state: JobStatus,
    /// `false` si el job ya era terminal (no hubo cambio de estado)
    pub changed: bool,
}

/// Cliente RPC hacia el otro nodo
#[derive(Debug, Clone)]
pub struct PeerClient {
    client: HttpClient,
}

impl PeerClient {
    pub fn new(client: HttpClient) -> Self {
        Self { client }
    }

    pub fn dispatch(&self, addr: &str, part: &PartDispatch) -> Result<DispatchAck> {
        self.client.post_json(addr, "/peer/dispatch", part)
    }

    pub fn callback(&self, addr: &str, callback: &UpdateCallback) -> Result<CallbackAck> {
        self.client.post_json(addr, "/peer/callback", callback)
    }

    /// Pide al scheduler del peer que detenga o quite un job
    pub fn cancel_execution(&self, addr: &str, job_id: &str) -> Result<CancelAck> {
        self.client.post_json(
            addr,
            "/peer/cancel",
            &CancelRequest {
                job_id: job_id.to_string(),
            },
        )
    }

    /// Consulta de progreso reenviada (el peer no vuelve a reenviar)
    pub fn query(&self, addr: &str, job_id: &str) -> Result<ProgressView> {
        self.client
            .get_json(addr, &format!("/jobs/progress?id={}&forwarded=1", job_id))
    }

    /// Cancelación de usuario reenviada al nodo dueño del registro
    pub fn cancel_job(&self, addr: &str, job_id: &str) -> Result<CancelResponse> {
        self.client.post_json(
            addr,
            "/jobs/cancel?forwarded=1",
            &CancelRequest {
                job_id: job_id.to_string(),
            },
        )
    }
}
