//! # Nodo del Cluster
//! src/node.rs
//!
//! Arma un nodo completo a partir de la configuración y expone las
//! operaciones que usan los handlers HTTP:
//!
//! - Cliente: `submit`, `query`, `cancel`, `history`, `status`.
//! - Peer: `accept_dispatch`, `accept_callback`, `accept_peer_cancel`.
//! - Cola compartida (solo si este nodo la aloja): `queue_*`.
//!
//! Los registros viven en el nodo que admitió el job. Una consulta o
//! cancelación de un id desconocido se reenvía una vez al peer.
//!
//! Cuando un job distribuido termina sin merge (cancelado, o con una parte
//! fallida) el aggregator detiene sus otras partes a través de
//! [`ExecutionStopper`], que implementa el nodo.

use crate::config::{Config, MAX_TARGET};
use crate::error::{ClusterError, Result};
use crate::http::HttpClient;
use crate::jobs::aggregator::{Aggregator, ExecutionStopper, FlushPolicy};
use crate::jobs::coordinator::{Coordinator, PartPlacement};
use crate::jobs::executor::ExecutorConfig;
use crate::jobs::peer::{
    CallbackAck, CancelAck, CancelOutcome, CancelRequest, CancelResponse, DispatchAck, PartDispatch,
    PeerClient, UpdateCallback,
};
use crate::jobs::queue::{LocalQueue, OverflowQueue, RemoteQueue};
use crate::jobs::scheduler::{Admission, Scheduler, SchedulerConfig};
use crate::jobs::storage::{JobStorage, JobStore};
use crate::jobs::types::{now_ms, JobKind, JobRecord, JobStatus, JobUpdate, ProgressView, WorkItem};
use crate::metrics::{AdmissionKind, MetricsCollector, MetricsSnapshot};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Cuántos jobs devuelve `/jobs/history`
pub const HISTORY_LIMIT: usize = 20;

/// Respuesta de `POST /jobs/submit`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitOutcome {
    pub job_id: String,
    /// `immediate`, `queued` o `distributed`
    pub admission_outcome: String,
    pub assigned_node: Option<String>,
    pub position: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parts: Option<Vec<PartPlacement>>,
}

/// Respuesta de `GET /status`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatus {
    pub node: String,
    pub address: String,
    pub peer: Option<String>,
    pub queue_host: String,
    pub running_count: usize,
    pub max_concurrent: usize,
    pub running_jobs: Vec<String>,
    pub queue_length: Option<usize>,
    pub backlog: usize,
    pub stored_jobs: usize,
    pub pending_flushes: usize,
}

pub struct Node {
    config: Config,
    own_addr: String,
    store: Arc<dyn JobStore>,
    /// Presente solo si la cola compartida vive en este nodo
    hosted_queue: Option<Arc<LocalQueue>>,
    queue: Arc<dyn OverflowQueue>,
    scheduler: Arc<Scheduler>,
    coordinator: Coordinator,
    aggregator: Aggregator,
    peer: PeerClient,
    metrics: MetricsCollector,
    sequence: AtomicU64,
}

impl Node {
    /// Valida la configuración y arranca scheduler y cola
    pub fn start(config: &Config) -> Result<Arc<Node>> {
        config.validate()?;

        let store: Arc<dyn JobStore> = if config.in_memory {
            Arc::new(JobStorage::in_memory())
        } else {
            let storage = JobStorage::open(config.storage_path())?;
            let interrupted = storage.fail_interrupted(&config.node_name)?;
            if interrupted > 0 {
                tracing::warn!(count = interrupted, "jobs interrupted by restart marked as failed");
            }
            Arc::new(storage)
        };

        let own_addr = config.advertised_address();
        let metrics = MetricsCollector::new();
        let client = HttpClient::new(config.node_name.clone(), config.peer_timeout());
        let peer = PeerClient::new(client.clone());
        let aggregator = Aggregator::new(
            own_addr.clone(),
            Arc::clone(&store),
            peer.clone(),
            FlushPolicy::from_config(config),
            metrics.clone(),
        );

        let (hosted_queue, queue): (Option<Arc<LocalQueue>>, Arc<dyn OverflowQueue>) =
            match &config.queue_host {
                None => {
                    let local = Arc::new(LocalQueue::new(config.queue_capacity));
                    let shared: Arc<dyn OverflowQueue> = local.clone();
                    (Some(local), shared)
                }
                Some(host) => (None, Arc::new(RemoteQueue::new(host.clone(), client))),
            };

        let scheduler = Arc::new(Scheduler::start(
            SchedulerConfig::from_config(config),
            ExecutorConfig::from_config(config),
            Arc::clone(&queue),
            Arc::clone(&store),
            aggregator.clone(),
            metrics.clone(),
        )?);

        let coordinator = Coordinator::new(
            config.node_name.clone(),
            own_addr.clone(),
            config.peer_addr.clone(),
            Arc::clone(&store),
            Arc::clone(&scheduler),
            peer.clone(),
            aggregator.clone(),
            metrics.clone(),
        );

        tracing::info!(
            node = %config.node_name,
            address = %own_addr,
            peer = config.peer_addr.as_deref().unwrap_or("none"),
            queue = config.queue_host.as_deref().unwrap_or("local"),
            "node started"
        );

        Ok(Arc::new_cyclic(|node: &Weak<Node>| {
            let stopper: Weak<dyn ExecutionStopper> = node.clone();
            aggregator.set_stopper(stopper);
            Node {
                config: config.clone(),
                own_addr,
                store,
                hosted_queue,
                queue,
                scheduler,
                coordinator,
                aggregator,
                peer,
                metrics,
                sequence: AtomicU64::new(0),
            }
        }))
    }

    pub fn name(&self) -> &str {
        &self.config.node_name
    }

    pub fn address(&self) -> &str {
        &self.own_addr
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.metrics.get_snapshot()
    }

    fn next_job_id(&self) -> String {
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        format!("{}-{:x}{:04x}", self.config.node_name, now_ms(), seq & 0xffff)
    }

    /// Admite un job para `target!`
    ///
    /// Por encima del umbral el job siempre se distribuye.
    pub fn submit(&self, target: i64) -> Result<SubmitOutcome> {
        if !(0..=MAX_TARGET as i64).contains(&target) {
            return Err(ClusterError::Validation(format!(
                "targetNumber must be between 0 and {}, got {}",
                MAX_TARGET, target
            )));
        }
        let n = target as u64;
        let job_id = self.next_job_id();

        if n > self.config.distribution_threshold {
            let parts = self.coordinator.distribute(&job_id, n)?;
            self.metrics.record_admission(AdmissionKind::Distributed);
            tracing::info!(job_id = %job_id, n, "job admitted as distributed");
            return Ok(SubmitOutcome {
                job_id,
                admission_outcome: "distributed".to_string(),
                assigned_node: None,
                position: None,
                parts: Some(parts),
            });
        }

        let record = JobRecord::single(&job_id, n, &self.config.node_name);
        self.store.create(&record)?;
        let item = WorkItem::from_record(&record, &self.own_addr);

        let admission = match self.scheduler.submit(item) {
            Ok(admission) => admission,
            Err(e) => {
                if matches!(e, ClusterError::QueueFull(_)) {
                    self.aggregator.enqueue_local(
                        &job_id,
                        JobUpdate::Failed {
                            reason: e.to_string(),
                        },
                    );
                }
                return Err(e);
            }
        };

        let (kind, assigned_node) = match admission {
            Admission::Immediate => (AdmissionKind::Immediate, Some(self.config.node_name.clone())),
            Admission::Queued { .. } => (AdmissionKind::Queued, None),
        };
        self.metrics.record_admission(kind);
        tracing::info!(job_id = %job_id, n, admission = admission.as_str(), "job admitted");

        Ok(SubmitOutcome {
            job_id,
            admission_outcome: admission.as_str().to_string(),
            assigned_node,
            position: admission.position(),
            parts: None,
        })
    }

    /// Progreso de un job; si no está aquí se pregunta una vez al peer
    pub fn query(&self, job_id: &str, forwarded: bool) -> Result<ProgressView> {
        if let Some(record) = self.store.find(job_id) {
            return Ok(record.to_view());
        }
        if let (false, Some(peer_addr)) = (forwarded, &self.config.peer_addr) {
            match self.peer.query(peer_addr, job_id) {
                Ok(view) => return Ok(view),
                Err(ClusterError::NotFound(_)) => {}
                Err(e) => {
                    tracing::warn!(job_id = %job_id, peer = %peer_addr, error = %e, "cannot forward progress query");
                }
            }
        }
        Err(ClusterError::NotFound(job_id.to_string()))
    }

    /// Cancela un job; cancelar un job terminal no cambia nada
    pub fn cancel(&self, job_id: &str, forwarded: bool) -> Result<CancelResponse> {
        let Some(record) = self.store.find(job_id) else {
            if let (false, Some(peer_addr)) = (forwarded, &self.config.peer_addr) {
                match self.peer.cancel_job(peer_addr, job_id) {
                    Ok(response) => return Ok(response),
                    Err(ClusterError::NotFound(_)) => {}
                    Err(e) => {
                        tracing::warn!(job_id = %job_id, peer = %peer_addr, error = %e, "cannot forward cancel");
                    }
                }
            }
            return Err(ClusterError::NotFound(job_id.to_string()));
        };

        if record.is_terminal() {
            tracing::debug!(job_id = %job_id, status = %record.status, "cancel on terminal job");
            return Ok(CancelResponse {
                job_id: job_id.to_string(),
                state: record.status,
                changed: false,
            });
        }

        // Las partes de un distribuido las detiene el aggregator al cancelar el padre
        if record.kind != JobKind::Distributed {
            self.stop_execution(job_id);
        }
        self.aggregator.enqueue_local(job_id, JobUpdate::Cancelled);
        tracing::info!(job_id = %job_id, kind = ?record.kind, "job cancelled");

        Ok(CancelResponse {
            job_id: job_id.to_string(),
            state: JobStatus::Cancelled,
            changed: true,
        })
    }

    /// Jobs recientes (sin partes), del más nuevo al más viejo
    pub fn history(&self) -> Vec<ProgressView> {
        let mut records: Vec<JobRecord> = self
            .store
            .list()
            .into_iter()
            .filter(|r| r.kind != JobKind::Part)
            .collect();
        records.sort_by(|a, b| {
            b.created_at_ms
                .cmp(&a.created_at_ms)
                .then_with(|| b.id.cmp(&a.id))
        });
        records
            .iter()
            .take(HISTORY_LIMIT)
            .map(JobRecord::to_view)
            .collect()
    }

    pub fn status(&self) -> NodeStatus {
        let stats = self.scheduler.stats();
        NodeStatus {
            node: self.config.node_name.clone(),
            address: self.own_addr.clone(),
            peer: self.config.peer_addr.clone(),
            queue_host: self
                .config
                .queue_host
                .clone()
                .unwrap_or_else(|| self.own_addr.clone()),
            running_count: stats.running_count,
            max_concurrent: stats.max_concurrent,
            running_jobs: stats.running_jobs,
            queue_length: self.queue.len().ok(),
            backlog: stats.backlog,
            stored_jobs: self.store.list().len(),
            pending_flushes: self.aggregator.pending_jobs(),
        }
    }

    // === Entradas del peer ===

    /// Acepta una parte enviada por el coordinador del otro nodo
    pub fn accept_dispatch(&self, dispatch: PartDispatch) -> Result<DispatchAck> {
        if dispatch.range.start == 0 || dispatch.range.end > MAX_TARGET {
            return Err(ClusterError::Validation(format!(
                "part range {} outside [1, {}]",
                dispatch.range, MAX_TARGET
            )));
        }

        let item = WorkItem {
            job_id: dispatch.part_id.clone(),
            kind: JobKind::Part,
            range: dispatch.range,
            seed: dispatch.seed,
            parent_id: Some(dispatch.parent_job_id.clone()),
            home: dispatch.callback_address.clone(),
            origin_node: dispatch.origin_node.clone(),
            enqueued_at_ms: now_ms(),
        };
        let admission = self.scheduler.submit(item)?;
        self.metrics.record_admission(match admission {
            Admission::Immediate => AdmissionKind::Immediate,
            Admission::Queued { .. } => AdmissionKind::Queued,
        });
        tracing::info!(
            part_id = %dispatch.part_id,
            parent_id = %dispatch.parent_job_id,
            origin = %dispatch.origin_node,
            admission = admission.as_str(),
            "part accepted from peer"
        );

        Ok(DispatchAck {
            accepted: true,
            admission: admission.as_str().to_string(),
            position: admission.position(),
            node: self.config.node_name.clone(),
        })
    }

    /// Update de un job cuyo registro vive aquí, enviado por quien lo ejecuta
    pub fn accept_callback(&self, callback: UpdateCallback) -> Result<CallbackAck> {
        if self.store.find(&callback.job_id).is_none() {
            return Err(ClusterError::NotFound(callback.job_id));
        }
        if !self
            .coordinator
            .accepts_update_from(&callback.job_id, &callback.sender)
        {
            tracing::info!(
                job_id = %callback.job_id,
                sender = %callback.sender,
                update = callback.update.name(),
                "update from revoked executor rejected"
            );
            return Ok(CallbackAck { accepted: false });
        }
        tracing::debug!(job_id = %callback.job_id, update = callback.update.name(), "update from peer");
        self.aggregator.enqueue_local(&callback.job_id, callback.update);
        Ok(CallbackAck { accepted: true })
    }

    pub fn accept_peer_cancel(&self, request: CancelRequest) -> CancelAck {
        let outcome = self.scheduler.cancel(&request.job_id);
        CancelAck {
            job_id: request.job_id,
            outcome,
        }
    }

    // === Cola compartida alojada ===

    fn hosted(&self) -> Result<&LocalQueue> {
        self.hosted_queue.as_deref().ok_or_else(|| {
            ClusterError::Protocol(format!(
                "{} does not host the overflow queue",
                self.config.node_name
            ))
        })
    }

    pub fn queue_push(&self, item: WorkItem) -> Result<usize> {
        self.hosted()?.push(item)
    }

    pub fn queue_pop(&self) -> Result<Option<WorkItem>> {
        self.hosted()?.pop_oldest()
    }

    pub fn queue_len(&self) -> Result<usize> {
        self.hosted()?.len()
    }

    pub fn queue_remove(&self, job_id: &str) -> Result<bool> {
        self.hosted()?.remove(job_id)
    }

    /// Detiene el scheduler; los executors en curso se cancelan
    pub fn shutdown(&self) {
        self.scheduler.shutdown();
        self.aggregator.close();
        tracing::info!(node = %self.config.node_name, "node stopped");
    }
}

impl ExecutionStopper for Node {
    /// Detiene o desencola la ejecución, esté en este nodo o en el peer
    fn stop_execution(&self, job_id: &str) {
        let outcome = self.scheduler.cancel(job_id);
        if outcome != CancelOutcome::NotHere {
            return;
        }
        if let Some(peer_addr) = &self.config.peer_addr {
            match self.peer.cancel_execution(peer_addr, job_id) {
                Ok(ack) => {
                    tracing::debug!(job_id = %job_id, outcome = ?ack.outcome, "peer handled cancel");
                }
                Err(e) => {
                    tracing::warn!(job_id = %job_id, peer = %peer_addr, error = %e, "cannot reach peer to cancel");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::types::FactorRange;
    use std::thread;
    use std::time::{Duration, Instant};

    fn test_config(max_concurrent: usize, step_delay_ms: u64) -> Config {
        Config {
            port: 9950,
            node_name: "node1".into(),
            max_concurrent,
            drain_interval_ms: 20,
            step_delay_ms,
            setup_delay_ms: 0,
            peer_timeout_ms: 300,
            flush_retry_delay_ms: 5,
            in_memory: true,
            ..Config::default()
        }
    }

    fn wait_state(node: &Node, id: &str, state: JobStatus) -> ProgressView {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let view = node.query(id, true).unwrap();
            if view.state == state {
                return view;
            }
            assert!(Instant::now() < deadline, "{} stuck in {}", id, view.state);
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_rejects_out_of_range_targets() {
        let node = Node::start(&test_config(2, 0)).unwrap();
        assert!(matches!(node.submit(171), Err(ClusterError::Validation(_))));
        assert!(matches!(node.submit(-1), Err(ClusterError::Validation(_))));
        assert!(node.history().is_empty());
        node.shutdown();
    }

    #[test]
    fn test_small_target_runs_single() {
        let node = Node::start(&test_config(2, 0)).unwrap();
        let outcome = node.submit(5).unwrap();
        assert_eq!(outcome.admission_outcome, "immediate");
        assert_eq!(outcome.assigned_node.as_deref(), Some("node1"));

        let view = wait_state(&node, &outcome.job_id, JobStatus::Completed);
        assert_eq!(view.current_or_final_result.as_deref(), Some("120"));
        assert_eq!(view.progress_percent, 100);
        node.shutdown();
    }

    #[test]
    fn test_zero_factorial() {
        let node = Node::start(&test_config(2, 0)).unwrap();
        let outcome = node.submit(0).unwrap();
        let view = wait_state(&node, &outcome.job_id, JobStatus::Completed);
        assert_eq!(view.current_or_final_result.as_deref(), Some("1"));
        node.shutdown();
    }

    #[test]
    fn test_large_target_without_peer_runs_both_parts_locally() {
        let node = Node::start(&test_config(2, 0)).unwrap();
        let outcome = node.submit(120).unwrap();
        assert_eq!(outcome.admission_outcome, "distributed");
        let parts = outcome.parts.unwrap();
        assert_eq!(parts[0].range, FactorRange::new(1, 60));
        assert_eq!(parts[1].range, FactorRange::new(61, 120));

        let view = wait_state(&node, &outcome.job_id, JobStatus::Completed);
        assert_eq!(
            view.current_or_final_result.unwrap(),
            FactorRange::for_target(120).product().to_string()
        );
        assert_eq!(view.parts.unwrap().len(), 2);

        // El historial no muestra las partes
        let history = node.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].job_id, outcome.job_id);
        node.shutdown();
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let node = Node::start(&test_config(1, 50)).unwrap();
        let outcome = node.submit(60).unwrap();
        thread::sleep(Duration::from_millis(80));

        let first = node.cancel(&outcome.job_id, false).unwrap();
        assert!(first.changed);
        wait_state(&node, &outcome.job_id, JobStatus::Cancelled);

        let second = node.cancel(&outcome.job_id, false).unwrap();
        assert!(!second.changed);
        assert_eq!(second.state, JobStatus::Cancelled);
        node.shutdown();
    }

    #[test]
    fn test_cancelled_part_stops_its_sibling() {
        let node = Node::start(&test_config(2, 20)).unwrap();
        let outcome = node.submit(120).unwrap();
        let part1 = format!("{}_part1", outcome.job_id);
        let part2 = format!("{}_part2", outcome.job_id);
        wait_state(&node, &part2, JobStatus::Running);

        assert!(node.cancel(&part1, false).unwrap().changed);
        wait_state(&node, &outcome.job_id, JobStatus::Cancelled);
        let sibling = wait_state(&node, &part2, JobStatus::Cancelled);
        assert!(sibling.progress_percent < 100);

        let deadline = Instant::now() + Duration::from_secs(5);
        while node.status().running_count > 0 {
            assert!(Instant::now() < deadline, "slots not reclaimed: {:?}", node.status().running_jobs);
            thread::sleep(Duration::from_millis(5));
        }
        node.shutdown();
    }

    #[test]
    fn test_unknown_job_is_not_found() {
        let node = Node::start(&test_config(1, 0)).unwrap();
        assert!(matches!(node.query("nope", false), Err(ClusterError::NotFound(_))));
        assert!(matches!(node.cancel("nope", false), Err(ClusterError::NotFound(_))));
        node.shutdown();
    }

    #[test]
    fn test_callback_for_unknown_job_is_rejected() {
        let node = Node::start(&test_config(1, 0)).unwrap();
        let result = node.accept_callback(UpdateCallback {
            job_id: "ghost".into(),
            parent_job_id: None,
            sender: "127.0.0.1:9951".into(),
            update: JobUpdate::Cancelled,
        });
        assert!(matches!(result, Err(ClusterError::NotFound(_))));
        node.shutdown();
    }
}
