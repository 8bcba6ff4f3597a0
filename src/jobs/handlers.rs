//! # Handlers HTTP para Jobs
//! src/jobs/handlers.rs
//!
//! Endpoints de cliente, de peer y de la cola compartida. Todos reciben el
//! [`Node`] como contexto y traducen los errores con
//! [`Response::from_error`].

use crate::error::{ClusterError, Result};
use crate::http::{Method, Request, Response, StatusCode};
use crate::jobs::peer::{CancelRequest, PartDispatch, UpdateCallback};
use crate::jobs::queue::{QueueLength, RemoveAck, RemoveRequest};
use crate::jobs::types::WorkItem;
use crate::node::Node;
use crate::router::Router;
use serde::{Deserialize, Serialize};
use serde_json::json;

/// Tabla de rutas del nodo
pub fn routes() -> Router<Node> {
    let mut router = Router::new();

    router.register(Method::POST, "/jobs/submit", submit_handler);
    router.register(Method::GET, "/jobs/progress", progress_handler);
    router.register(Method::POST, "/jobs/cancel", cancel_handler);
    router.register(Method::GET, "/jobs/history", history_handler);

    router.register(Method::GET, "/status", status_handler);
    router.register(Method::GET, "/metrics", metrics_handler);

    router.register(Method::POST, "/peer/dispatch", peer_dispatch_handler);
    router.register(Method::POST, "/peer/callback", peer_callback_handler);
    router.register(Method::POST, "/peer/cancel", peer_cancel_handler);

    router.register(Method::POST, "/queue/push", queue_push_handler);
    router.register(Method::POST, "/queue/pop", queue_pop_handler);
    router.register(Method::GET, "/queue/len", queue_len_handler);
    router.register(Method::POST, "/queue/remove", queue_remove_handler);

    router
}

fn respond<T: Serialize>(result: Result<T>) -> Response {
    match result {
        Ok(value) => Response::json_value(StatusCode::Ok, &value),
        Err(e) => Response::from_error(&e),
    }
}

fn is_forwarded(req: &Request) -> bool {
    req.query_param("forwarded") == Some("1")
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmitRequest {
    target_number: i64,
}

/// `?number=N` o body `{"targetNumber": N}`
fn target_number(req: &Request) -> Result<i64> {
    match req.query_param("number") {
        Some(raw) => raw
            .parse()
            .map_err(|_| ClusterError::Validation(format!("number must be an integer, got '{}'", raw))),
        None => Ok(req.json::<SubmitRequest>()?.target_number),
    }
}

/// Handler para `POST /jobs/submit`
///
/// # Ejemplo de response
/// ```json
/// {"jobId": "node1-18f2a…", "admissionOutcome": "queued", "assignedNode": null, "position": 1}
/// ```
pub fn submit_handler(req: &Request, node: &Node) -> Response {
    respond(target_number(req).and_then(|target| node.submit(target)))
}

/// Handler para `GET /jobs/progress?id=JOBID`
pub fn progress_handler(req: &Request, node: &Node) -> Response {
    let Some(id) = req.query_param("id") else {
        return Response::error(StatusCode::BadRequest, "Missing required parameter: id");
    };
    respond(node.query(id, is_forwarded(req)))
}

/// Handler para `POST /jobs/cancel?id=JOBID` (o body `{"jobId": …}`)
pub fn cancel_handler(req: &Request, node: &Node) -> Response {
    let id = match req.query_param("id") {
        Some(id) => id.to_string(),
        None => match req.json::<CancelRequest>() {
            Ok(body) => body.job_id,
            Err(_) => {
                return Response::error(StatusCode::BadRequest, "Missing required parameter: id")
            }
        },
    };
    respond(node.cancel(&id, is_forwarded(req)))
}

/// Handler para `GET /jobs/history`
pub fn history_handler(_req: &Request, node: &Node) -> Response {
    Response::json_value(StatusCode::Ok, &json!({ "jobs": node.history() }))
}

/// Handler para `GET /status`
pub fn status_handler(_req: &Request, node: &Node) -> Response {
    Response::json_value(StatusCode::Ok, &node.status())
}

/// Handler para `GET /metrics`
pub fn metrics_handler(_req: &Request, node: &Node) -> Response {
    Response::json_value(StatusCode::Ok, &node.metrics_snapshot())
}

pub fn peer_dispatch_handler(req: &Request, node: &Node) -> Response {
    respond(
        req.json::<PartDispatch>()
            .and_then(|dispatch| node.accept_dispatch(dispatch)),
    )
}

pub fn peer_callback_handler(req: &Request, node: &Node) -> Response {
    respond(
        req.json::<UpdateCallback>()
            .and_then(|callback| node.accept_callback(callback)),
    )
}

pub fn peer_cancel_handler(req: &Request, node: &Node) -> Response {
    respond(
        req.json::<CancelRequest>()
            .map(|request| node.accept_peer_cancel(request)),
    )
}

pub fn queue_push_handler(req: &Request, node: &Node) -> Response {
    respond(
        req.json::<WorkItem>()
            .and_then(|item| node.queue_push(item))
            .map(|length| QueueLength { length }),
    )
}

pub fn queue_pop_handler(_req: &Request, node: &Node) -> Response {
    respond(node.queue_pop())
}

pub fn queue_len_handler(_req: &Request, node: &Node) -> Response {
    respond(node.queue_len().map(|length| QueueLength { length }))
}

pub fn queue_remove_handler(req: &Request, node: &Node) -> Response {
    respond(
        req.json::<RemoveRequest>()
            .and_then(|request| node.queue_remove(&request.job_id))
            .map(|removed| RemoveAck { removed }),
    )
}
