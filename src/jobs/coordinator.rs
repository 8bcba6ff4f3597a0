//! # Coordinador de Jobs Distribuidos
//! src/jobs/coordinator.rs
//!
//! Un job con N por encima del umbral se parte en dos rangos contiguos:
//!
//! ```text
//! [1, N] ──split──► part1 [1, N/2]      → scheduler local
//!                   part2 [N/2+1, N]    → peer (/peer/dispatch), o local si falla
//! ```
//!
//! El padre y sus partes viven en el nodo que admitió el job. Cada cambio de
//! una parte llega al padre como un `PartReport` a través del aggregator, y
//! cuando ambas partes completaron se multiplica `part1 × part2`.
//!
//! Un dispatch que vence por timeout puede haber llegado igual al peer. Antes
//! de correr la parte localmente se le pide al peer que la cancele, y sus
//! updates para esa parte dejan de aceptarse.

use crate::error::{ClusterError, Result};
use crate::jobs::aggregator::Aggregator;
use crate::jobs::peer::{PartDispatch, PeerClient};
use crate::jobs::scheduler::{Admission, Scheduler};
use crate::jobs::storage::JobStore;
use crate::jobs::types::{BigValue, FactorRange, JobRecord, JobStatus, JobUpdate, PartInfo, WorkItem};
use crate::metrics::MetricsCollector;
use num_bigint::BigUint;
use num_traits::One;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

/// Arma el padre y sus dos partes, sin persistir nada
pub fn plan_parts(
    parent_id: &str,
    n: u64,
    own_node: &str,
    part2_node: &str,
) -> (JobRecord, Vec<JobRecord>) {
    let (left, right) = FactorRange::for_target(n).split_half();
    let parts = vec![
        JobRecord::part(format!("{}_part1", parent_id), parent_id, n, left, own_node),
        JobRecord::part(format!("{}_part2", parent_id), parent_id, n, right, part2_node),
    ];
    let infos = parts
        .iter()
        .map(|p| PartInfo {
            part_id: p.id.clone(),
            range: p.range,
            assigned_node: p.owner_node.clone(),
            progress: 0,
            result: None,
            status: JobStatus::Queued,
        })
        .collect();
    (JobRecord::distributed(parent_id, n, own_node, infos), parts)
}

/// Aplica al padre el estado reportado por una de sus partes
pub(crate) fn apply_part_report(
    parent: &mut JobRecord,
    part_id: &str,
    status: JobStatus,
    percent: u8,
    result: Option<BigValue>,
    error: Option<String>,
) {
    let Some(part) = parent.parts.iter_mut().find(|p| p.part_id == part_id) else {
        tracing::warn!(job_id = %parent.id, part_id = %part_id, "report for unknown part ignored");
        return;
    };
    part.progress = part.progress.max(percent);
    part.status = status;
    if result.is_some() {
        part.result = result;
    }
    let node = part.assigned_node.clone();

    match status {
        JobStatus::Failed => {
            parent.error = Some(format!(
                "part {} failed: {}",
                part_id,
                error.unwrap_or_else(|| "unknown error".to_string())
            ));
            parent.push_step(&node, format!("{} failed", part_id));
            parent.finish(JobStatus::Failed);
        }
        JobStatus::Cancelled => {
            parent.push_step(&node, format!("{} cancelled", part_id));
            parent.finish(JobStatus::Cancelled);
        }
        JobStatus::Completed => {
            parent.push_step(&node, format!("{} completed", part_id));
            if parent.parts.iter().all(|p| p.status == JobStatus::Completed) {
                merge_parts(parent);
            } else {
                refresh_progress(parent);
            }
        }
        JobStatus::Queued | JobStatus::Running => refresh_progress(parent),
    }
}

/// Promedio de las partes, sin bajar y sin llegar a 100 antes del merge
fn refresh_progress(parent: &mut JobRecord) {
    if parent.parts.is_empty() {
        return;
    }
    let sum: u32 = parent.parts.iter().map(|p| p.progress as u32).sum();
    let avg = (sum / parent.parts.len() as u32).min(99) as u8;
    parent.progress = parent.progress.max(avg);
}

/// Multiplica los resultados de las partes en el padre
///
/// Si falta algún resultado o los rangos no cubren `[1, N]` el padre queda
/// `Failed` con un error de inconsistencia.
pub fn merge_parts(parent: &mut JobRecord) {
    match merged_product(parent) {
        Ok(product) => {
            parent.progress = 100;
            parent.accumulated_result = Some(BigValue(product));
            let owner = parent.owner_node.clone();
            parent.push_step(&owner, format!("merged {} parts", parent.parts.len()));
            parent.finish(JobStatus::Completed);
        }
        Err(e) => {
            tracing::error!(job_id = %parent.id, error = %e, "cannot merge distributed job");
            parent.error = Some(e.to_string());
            parent.finish(JobStatus::Failed);
        }
    }
}

fn merged_product(parent: &JobRecord) -> Result<BigUint> {
    let mut ranges: Vec<FactorRange> = parent.parts.iter().map(|p| p.range).collect();
    ranges.sort_by_key(|r| r.start);
    let mut next = 1;
    for range in &ranges {
        if range.start != next {
            return Err(ClusterError::MergeInconsistency(format!(
                "parts of {} leave a gap before {}",
                parent.id, range.start
            )));
        }
        next = range.end + 1;
    }
    if next != parent.target_number + 1 {
        return Err(ClusterError::MergeInconsistency(format!(
            "parts of {} end at {} instead of {}",
            parent.id,
            next - 1,
            parent.target_number
        )));
    }

    parent.parts.iter().try_fold(BigUint::one(), |acc, part| {
        part.result
            .as_ref()
            .map(|value| acc * value.as_biguint())
            .ok_or_else(|| {
                ClusterError::MergeInconsistency(format!(
                    "part {} completed without a result",
                    part.part_id
                ))
            })
    })
}

/// Dónde quedó cada parte
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PartPlacement {
    pub part_id: String,
    pub range: FactorRange,
    pub node: String,
    pub admission: String,
    pub position: Option<usize>,
}

pub struct Coordinator {
    node_name: String,
    own_addr: String,
    peer_addr: Option<String>,
    store: Arc<dyn JobStore>,
    scheduler: Arc<Scheduler>,
    peer: PeerClient,
    aggregator: Aggregator,
    metrics: MetricsCollector,
    /// Parte → dirección del peer cuyo dispatch se abandonó
    revoked: Mutex<HashMap<String, String>>,
}

impl Coordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        node_name: impl Into<String>,
        own_addr: impl Into<String>,
        peer_addr: Option<String>,
        store: Arc<dyn JobStore>,
        scheduler: Arc<Scheduler>,
        peer: PeerClient,
        aggregator: Aggregator,
        metrics: MetricsCollector,
    ) -> Self {
        Self {
            node_name: node_name.into(),
            own_addr: own_addr.into(),
            peer_addr,
            store,
            scheduler,
            peer,
            aggregator,
            metrics,
            revoked: Mutex::new(HashMap::new()),
        }
    }

    /// `false` si `sender` corre una copia abandonada de la parte `job_id`
    pub fn accepts_update_from(&self, job_id: &str, sender: &str) -> bool {
        self.revoked
            .lock()
            .get(job_id)
            .map_or(true, |revoked| revoked != sender)
    }

    /// Crea el job distribuido `job_id` para `n!` y reparte sus partes
    pub fn distribute(&self, job_id: &str, n: u64) -> Result<Vec<PartPlacement>> {
        let (parent, parts) = plan_parts(job_id, n, &self.node_name, &self.node_name);
        for part in &parts {
            self.store.create(part)?;
        }
        self.store.create(&parent)?;
        tracing::info!(
            job_id = %job_id,
            n,
            part1 = %parts[0].range,
            part2 = %parts[1].range,
            "distributed job created"
        );

        let first = self.run_locally(&parts[0])?;
        let second = match &self.peer_addr {
            Some(peer_addr) => self.dispatch_to_peer(peer_addr, &parts[1])?,
            None => self.run_locally(&parts[1])?,
        };
        Ok(vec![first, second])
    }

    fn run_locally(&self, part: &JobRecord) -> Result<PartPlacement> {
        let item = WorkItem::from_record(part, &self.own_addr);
        match self.scheduler.submit(item) {
            Ok(admission) => Ok(self.placement(part, &self.node_name, admission)),
            Err(e) => {
                // Un fallo de arranque ya marcó la parte; una cola llena no
                if matches!(e, ClusterError::QueueFull(_)) {
                    self.aggregator.enqueue_local(
                        &part.id,
                        JobUpdate::Failed {
                            reason: e.to_string(),
                        },
                    );
                }
                Err(e)
            }
        }
    }

    fn dispatch_to_peer(&self, peer_addr: &str, part: &JobRecord) -> Result<PartPlacement> {
        let dispatch = PartDispatch {
            part_id: part.id.clone(),
            range: part.range,
            seed: part.initial_accumulator.clone(),
            parent_job_id: part.parent_id.clone().unwrap_or_default(),
            callback_address: self.own_addr.clone(),
            origin_node: self.node_name.clone(),
        };

        let refused = match self.peer.dispatch(peer_addr, &dispatch) {
            Ok(ack) if ack.accepted => {
                tracing::info!(part_id = %part.id, peer = %ack.node, admission = %ack.admission, "part dispatched to peer");
                self.assign(part, &ack.node);
                return Ok(PartPlacement {
                    part_id: part.id.clone(),
                    range: part.range,
                    node: ack.node,
                    admission: ack.admission,
                    position: ack.position,
                });
            }
            Ok(ack) => format!("{} refused the part", ack.node),
            Err(e) => e.to_string(),
        };

        tracing::warn!(part_id = %part.id, peer = %peer_addr, reason = %refused, "peer dispatch failed, running part locally");
        self.revoke(peer_addr, part);
        self.metrics.record_peer_fallback();
        self.assign(part, &self.node_name);
        self.run_locally(part)
    }

    /// El peer pudo haber aceptado la parte aunque no llegó el ack
    fn revoke(&self, peer_addr: &str, part: &JobRecord) {
        {
            let mut revoked = self.revoked.lock();
            revoked.retain(|id, _| self.store.find(id).map_or(false, |r| !r.is_terminal()));
            revoked.insert(part.id.clone(), peer_addr.to_string());
        }
        match self.peer.cancel_execution(peer_addr, &part.id) {
            Ok(ack) => {
                tracing::info!(part_id = %part.id, peer = %peer_addr, outcome = ?ack.outcome, "peer copy of part cancelled");
            }
            Err(e) => {
                tracing::debug!(part_id = %part.id, peer = %peer_addr, error = %e, "peer did not confirm cancel");
            }
        }
    }

    fn assign(&self, part: &JobRecord, node: &str) {
        if let Some(parent_id) = &part.parent_id {
            self.aggregator.enqueue_local(
                parent_id,
                JobUpdate::PartAssigned {
                    part_id: part.id.clone(),
                    node: node.to_string(),
                },
            );
        }
    }

    fn placement(&self, part: &JobRecord, node: &str, admission: Admission) -> PartPlacement {
        PartPlacement {
            part_id: part.id.clone(),
            range: part.range,
            node: node.to_string(),
            admission: admission.as_str().to_string(),
            position: admission.position(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::request::header_end;
    use crate::http::{HttpClient, Response, StatusCode};
    use crate::jobs::aggregator::FlushPolicy;
    use crate::jobs::executor::ExecutorConfig;
    use crate::jobs::queue::LocalQueue;
    use crate::jobs::scheduler::SchedulerConfig;
    use crate::jobs::storage::JobStorage;
    use proptest::prelude::*;
    use serde_json::json;
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::thread;
    use std::time::{Duration, Instant};

    fn completed(parent: &mut JobRecord, index: usize) {
        let part = parent.parts[index].clone();
        apply_part_report(
            parent,
            &part.part_id,
            JobStatus::Completed,
            100,
            Some(BigValue(part.range.product())),
            None,
        );
    }

    proptest! {
        #[test]
        fn split_covers_target_without_overlap(n in 2u64..=170) {
            let (parent, parts) = plan_parts("j", n, "node1", "node2");
            prop_assert_eq!(parts.len(), 2);
            prop_assert_eq!(parts[0].range.start, 1);
            prop_assert_eq!(parts[0].range.end, n / 2);
            prop_assert_eq!(parts[0].range.end + 1, parts[1].range.start);
            prop_assert_eq!(parts[1].range.end, n);
            prop_assert_eq!(parent.parts[1].assigned_node.as_str(), "node2");
        }

        #[test]
        fn merge_matches_direct_factorial(n in 2u64..=170, reversed in any::<bool>()) {
            let (mut parent, _) = plan_parts("j", n, "node1", "node1");
            if reversed {
                completed(&mut parent, 1);
                completed(&mut parent, 0);
            } else {
                completed(&mut parent, 0);
                completed(&mut parent, 1);
            }
            prop_assert_eq!(parent.status, JobStatus::Completed);
            prop_assert_eq!(parent.progress, 100);
            prop_assert_eq!(
                parent.accumulated_result.unwrap().0,
                FactorRange::for_target(n).product()
            );
        }
    }

    #[test]
    fn test_parent_progress_is_average_below_100() {
        let (mut parent, _) = plan_parts("j", 100, "node1", "node1");
        apply_part_report(&mut parent, "j_part1", JobStatus::Running, 60, None, None);
        assert_eq!(parent.progress, 30);
        apply_part_report(&mut parent, "j_part2", JobStatus::Running, 40, None, None);
        assert_eq!(parent.progress, 50);

        completed(&mut parent, 0);
        assert_eq!(parent.status, JobStatus::Running);
        assert_eq!(parent.progress, 70);
    }

    #[test]
    fn test_failed_part_fails_parent() {
        let (mut parent, _) = plan_parts("j", 100, "node1", "node2");
        apply_part_report(
            &mut parent,
            "j_part2",
            JobStatus::Failed,
            20,
            None,
            Some("executor fault: boom".into()),
        );
        assert_eq!(parent.status, JobStatus::Failed);
        assert!(parent.error.as_deref().unwrap().contains("j_part2"));
        assert!(parent.accumulated_result.is_none());
    }

    #[test]
    fn test_cancelled_part_cancels_parent() {
        let (mut parent, _) = plan_parts("j", 100, "node1", "node2");
        apply_part_report(&mut parent, "j_part1", JobStatus::Cancelled, 35, None, None);
        assert_eq!(parent.status, JobStatus::Cancelled);
        assert!(parent.error.is_none());
    }

    #[test]
    fn test_missing_result_is_inconsistent() {
        let (mut parent, _) = plan_parts("j", 80, "node1", "node1");
        completed(&mut parent, 0);
        apply_part_report(&mut parent, "j_part2", JobStatus::Completed, 100, None, None);
        assert_eq!(parent.status, JobStatus::Failed);
        assert!(parent.error.as_deref().unwrap().starts_with("merge inconsistency"));
    }

    #[test]
    fn test_gap_between_parts_is_inconsistent() {
        let (mut parent, _) = plan_parts("j", 80, "node1", "node1");
        parent.parts[1].range = FactorRange::new(42, 80);
        completed(&mut parent, 0);
        completed(&mut parent, 1);
        assert_eq!(parent.status, JobStatus::Failed);
    }

    const OWN: &str = "127.0.0.1:9911";

    fn coordinator(
        peer_addr: Option<String>,
        timeout: Duration,
    ) -> (Coordinator, Arc<JobStorage>, MetricsCollector) {
        let store = Arc::new(JobStorage::in_memory());
        let metrics = MetricsCollector::new();
        let own = OWN;
        let client = HttpClient::new("node1", timeout);
        let aggregator = Aggregator::new(
            own,
            store.clone(),
            PeerClient::new(client.clone()),
            FlushPolicy {
                retries: 3,
                retry_delay: Duration::from_millis(5),
            },
            metrics.clone(),
        );
        let scheduler = Arc::new(
            Scheduler::start(
                SchedulerConfig {
                    node_name: "node1".into(),
                    own_addr: own.into(),
                    max_concurrent: 2,
                    drain_interval: Duration::from_millis(20),
                    cancel_grace: Duration::from_millis(500),
                },
                ExecutorConfig {
                    node_name: "node1".into(),
                    step_delay: Duration::ZERO,
                    setup_delay: Duration::ZERO,
                },
                Arc::new(LocalQueue::new(10)),
                store.clone(),
                aggregator.clone(),
                metrics.clone(),
            )
            .unwrap(),
        );
        let coordinator = Coordinator::new(
            "node1",
            own,
            peer_addr,
            store.clone(),
            scheduler,
            PeerClient::new(client),
            aggregator,
            metrics.clone(),
        );
        (coordinator, store, metrics)
    }

    fn wait_merged(store: &JobStorage, id: &str, n: u64) -> JobRecord {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let parent = store.find(id).unwrap();
            if parent.status == JobStatus::Completed {
                assert_eq!(
                    parent.accumulated_result.as_ref().unwrap().0,
                    FactorRange::for_target(n).product()
                );
                return parent;
            }
            assert!(Instant::now() < deadline, "distributed job never completed");
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn test_unreachable_peer_falls_back_to_local() {
        let dead = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().to_string()
        };
        let (coordinator, store, metrics) = coordinator(Some(dead), Duration::from_millis(200));

        let placements = coordinator.distribute("big", 100).unwrap();
        assert_eq!(placements[1].node, "node1");
        assert_eq!(metrics.get_snapshot().jobs.peer_fallbacks, 1);

        let parent = wait_merged(&store, "big", 100);
        assert!(parent.parts.iter().all(|p| p.assigned_node == "node1"));
    }

    /// Peer que anota cada request y contesta el dispatch después de `ack_delay`
    fn slow_peer(ack_delay: Duration) -> (String, Arc<Mutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);

        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(mut stream) = stream else { continue };
                let log = Arc::clone(&log);
                thread::spawn(move || {
                    let Some(head) = read_head(&mut stream) else { return };
                    let line = head.lines().next().unwrap_or_default().to_string();
                    log.lock().push(line.clone());

                    let body = if line.starts_with("POST /peer/dispatch") {
                        thread::sleep(ack_delay);
                        json!({"accepted": true, "admission": "immediate", "position": null, "node": "node2"})
                    } else {
                        json!({"jobId": "big_part2", "outcome": "signalled"})
                    };
                    let response = Response::json_value(StatusCode::Ok, &body);
                    let _ = stream.write_all(&response.to_bytes());
                });
            }
        });
        (addr, seen)
    }

    /// Lee headers y body completos; devuelve los headers
    fn read_head(stream: &mut TcpStream) -> Option<String> {
        let mut buffer = Vec::new();
        let mut chunk = [0u8; 1024];
        let end = loop {
            if let Some(pos) = header_end(&buffer) {
                break pos + 4;
            }
            let n = stream.read(&mut chunk).ok().filter(|n| *n > 0)?;
            buffer.extend_from_slice(&chunk[..n]);
        };
        let head = String::from_utf8_lossy(&buffer[..end]).to_string();
        let length = head
            .lines()
            .filter_map(|l| l.split_once(':'))
            .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
            .and_then(|(_, v)| v.trim().parse::<usize>().ok())
            .unwrap_or(0);
        while buffer.len() < end + length {
            let n = stream.read(&mut chunk).ok().filter(|n| *n > 0)?;
            buffer.extend_from_slice(&chunk[..n]);
        }
        Some(head)
    }

    #[test]
    fn test_late_dispatch_ack_cancels_peer_copy() {
        let (peer_addr, seen) = slow_peer(Duration::from_millis(400));
        let (coordinator, store, metrics) =
            coordinator(Some(peer_addr.clone()), Duration::from_millis(150));

        let placements = coordinator.distribute("big", 100).unwrap();
        assert_eq!(placements[1].node, "node1");
        assert_eq!(metrics.get_snapshot().jobs.peer_fallbacks, 1);

        let requests = seen.lock().clone();
        assert!(requests.iter().any(|r| r.starts_with("POST /peer/dispatch")));
        assert!(requests.iter().any(|r| r.starts_with("POST /peer/cancel")));

        // La copia del peer ya no puede escribir en la parte
        assert!(!coordinator.accepts_update_from("big_part2", &peer_addr));
        assert!(coordinator.accepts_update_from("big_part2", OWN));
        assert!(coordinator.accepts_update_from("big_part1", &peer_addr));

        let parent = wait_merged(&store, "big", 100);
        assert_eq!(parent.parts[1].assigned_node, "node1");
    }
}
