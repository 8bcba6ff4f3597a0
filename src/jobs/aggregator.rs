//! # Aggregator de Progreso
//! src/jobs/aggregator.rs
//!
//! Único escritor de los registros de jobs. Cada job tiene un buffer de
//! updates pendientes y una marca de flush en curso:
//!
//! ```text
//! enqueue(job, u) ──► pending[job].push(u)
//!                     si !in_flight ─► in_flight = true, thread de flush
//! flush(job): loop { drenar pending; aplicar en orden } hasta que pending quede vacío
//! ```
//!
//! Así los updates de un mismo job se aplican en orden de llegada y nunca
//! en paralelo, aunque vengan de executors o nodos distintos. Un update cuyo
//! registro vive en otro nodo se reenvía a ese nodo (`/peer/callback`), donde
//! su propio aggregator lo aplica.
//!
//! ## Reintentos
//!
//! Un update de progreso se descarta tras `retries` intentos fallidos. Un
//! update final (`Completed`, `Failed`, `Cancelled` o el reporte terminal de
//! una parte) se sigue reintentando con backoff hasta que se aplica, o hasta
//! que el nodo se apaga.

use crate::error::{ClusterError, Result};
use crate::jobs::peer::{PeerClient, UpdateCallback};
use crate::jobs::storage::JobStore;
use crate::jobs::types::{ApplyOutcome, JobKind, JobRecord, JobStatus, JobUpdate, WorkItem};
use crate::metrics::MetricsCollector;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

/// Tope del backoff de un update final
const MAX_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Política de reintento por update
#[derive(Debug, Clone)]
pub struct FlushPolicy {
    /// Intentos antes de descartar un update de progreso
    pub retries: u32,
    pub retry_delay: Duration,
}

/// Detiene la ejecución de un job, corra donde corra
///
/// Lo usa el aggregator cuando un job distribuido termina sin merge y sus
/// otras partes ya no sirven.
pub trait ExecutionStopper: Send + Sync {
    fn stop_execution(&self, job_id: &str);
}

impl FlushPolicy {
    pub fn from_config(config: &crate::config::Config) -> Self {
        Self {
            retries: config.flush_retries.max(1),
            retry_delay: Duration::from_millis(config.flush_retry_delay_ms),
        }
    }
}

struct Envelope {
    /// Dirección del nodo dueño del registro
    home: String,
    parent_id: Option<String>,
    update: JobUpdate,
}

#[derive(Default)]
struct JobBuffer {
    pending: VecDeque<Envelope>,
    in_flight: bool,
}

struct Inner {
    own_addr: String,
    store: Arc<dyn JobStore>,
    peer: PeerClient,
    policy: FlushPolicy,
    buffers: Mutex<HashMap<String, JobBuffer>>,
    metrics: MetricsCollector,
    stopper: Mutex<Option<Weak<dyn ExecutionStopper>>>,
    closed: AtomicBool,
}

/// Serializa las escrituras por job
#[derive(Clone)]
pub struct Aggregator {
    inner: Arc<Inner>,
}

impl Aggregator {
    pub fn new(
        own_addr: impl Into<String>,
        store: Arc<dyn JobStore>,
        peer: PeerClient,
        policy: FlushPolicy,
        metrics: MetricsCollector,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                own_addr: own_addr.into(),
                store,
                peer,
                policy,
                buffers: Mutex::new(HashMap::new()),
                metrics,
                stopper: Mutex::new(None),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn set_stopper(&self, stopper: Weak<dyn ExecutionStopper>) {
        *self.inner.stopper.lock() = Some(stopper);
    }

    /// Corta los reintentos sin límite de los updates finales
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
    }

    /// Encola un update para un registro que vive en este nodo
    pub fn enqueue_local(&self, job_id: &str, update: JobUpdate) {
        let home = self.inner.own_addr.clone();
        self.enqueue(&home, job_id, None, update);
    }

    /// Encola un update para el registro de un item, viva donde viva
    pub fn enqueue_for(&self, item: &WorkItem, update: JobUpdate) {
        self.enqueue(&item.home, &item.job_id, item.parent_id.as_deref(), update);
    }

    pub fn enqueue(&self, home: &str, job_id: &str, parent_id: Option<&str>, update: JobUpdate) {
        Inner::enqueue(
            &self.inner,
            job_id,
            Envelope {
                home: home.to_string(),
                parent_id: parent_id.map(str::to_string),
                update,
            },
        );
    }

    /// `true` si no hay updates pendientes ni flushes en curso
    pub fn is_idle(&self) -> bool {
        self.inner.buffers.lock().is_empty()
    }

    pub fn pending_jobs(&self) -> usize {
        self.inner.buffers.lock().len()
    }
}

impl Inner {
    fn enqueue(this: &Arc<Inner>, job_id: &str, envelope: Envelope) {
        let start_flush = {
            let mut buffers = this.buffers.lock();
            let buffer = buffers.entry(job_id.to_string()).or_default();
            buffer.pending.push_back(envelope);
            if buffer.in_flight {
                false
            } else {
                buffer.in_flight = true;
                true
            }
        };

        if start_flush {
            let worker = Arc::clone(this);
            let id = job_id.to_string();
            let spawned = thread::Builder::new()
                .name(format!("flush-{}", job_id))
                .spawn(move || worker.flush(&id));
            if let Err(e) = spawned {
                tracing::warn!(job_id = %job_id, error = %e, "cannot spawn flush thread, flushing inline");
                this.flush(job_id);
            }
        }
    }

    /// Drena el buffer del job hasta dejarlo vacío
    fn flush(&self, job_id: &str) {
        loop {
            let batch: Vec<Envelope> = {
                let mut buffers = self.buffers.lock();
                match buffers.get_mut(job_id) {
                    Some(buffer) if !buffer.pending.is_empty() => buffer.pending.drain(..).collect(),
                    _ => {
                        buffers.remove(job_id);
                        return;
                    }
                }
            };

            for envelope in batch {
                self.deliver(job_id, envelope);
            }
        }
    }

    fn deliver(&self, job_id: &str, envelope: Envelope) {
        let is_final = envelope.update.is_final();
        let mut delay = self.policy.retry_delay;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = if envelope.home == self.own_addr {
                self.apply_local(job_id, &envelope.update)
            } else {
                self.forward(job_id, &envelope)
            };

            match result {
                Ok(()) => return,
                Err(e) if e.is_transient() && self.should_retry(is_final, attempt) => {
                    tracing::warn!(
                        job_id = %job_id,
                        update = envelope.update.name(),
                        attempt,
                        error = %e,
                        "update write failed, retrying"
                    );
                    thread::sleep(delay);
                    if attempt >= self.policy.retries {
                        delay = (delay * 2).min(MAX_RETRY_DELAY);
                    }
                }
                Err(e) => {
                    tracing::error!(
                        job_id = %job_id,
                        update = envelope.update.name(),
                        attempts = attempt,
                        error = %e,
                        "update dropped"
                    );
                    self.metrics.record_dropped_update();
                    return;
                }
            }
        }
    }

    fn should_retry(&self, is_final: bool, attempt: u32) -> bool {
        attempt < self.policy.retries || (is_final && !self.closed.load(Ordering::SeqCst))
    }

    fn forward(&self, job_id: &str, envelope: &Envelope) -> Result<()> {
        let ack = self.peer.callback(
            &envelope.home,
            &UpdateCallback {
                job_id: job_id.to_string(),
                parent_job_id: envelope.parent_id.clone(),
                sender: self.own_addr.clone(),
                update: envelope.update.clone(),
            },
        )?;
        if !ack.accepted {
            // El dueño reasignó el job a otro executor
            tracing::info!(
                job_id = %job_id,
                home = %envelope.home,
                update = envelope.update.name(),
                "update discarded by home, execution was reassigned"
            );
        }
        Ok(())
    }

    /// Lee, aplica y guarda; cada intento parte del registro guardado
    fn apply_local(&self, job_id: &str, update: &JobUpdate) -> Result<()> {
        let mut record = self
            .store
            .find(job_id)
            .ok_or_else(|| ClusterError::NotFound(job_id.to_string()))?;
        let was_terminal = record.is_terminal();

        match record.apply(update.clone()) {
            ApplyOutcome::IgnoredTerminal => {
                tracing::info!(
                    job_id = %job_id,
                    status = %record.status,
                    update = update.name(),
                    "update ignored, job already terminal"
                );
                return Ok(());
            }
            ApplyOutcome::IdempotentCancel => {
                tracing::debug!(job_id = %job_id, "job already cancelled");
                return Ok(());
            }
            ApplyOutcome::Applied => {}
        }

        self.store.save(&record)?;

        if let JobUpdate::Progress { percent, .. } = update {
            tracing::debug!(job_id = %job_id, percent = *percent, "progress recorded");
        } else if record.is_terminal() && !was_terminal {
            tracing::info!(
                job_id = %job_id,
                kind = ?record.kind,
                status = %record.status,
                error = record.error.as_deref().unwrap_or(""),
                "job finished"
            );
        }

        if record.kind == JobKind::Distributed
            && !was_terminal
            && matches!(record.status, JobStatus::Failed | JobStatus::Cancelled)
        {
            self.abort_open_parts(&record);
        }

        if record.kind == JobKind::Part {
            if let Some(parent_id) = record.parent_id.clone() {
                let report = JobUpdate::PartReport {
                    part_id: record.id.clone(),
                    status: record.status,
                    percent: record.progress,
                    result: record.accumulated_result.clone().filter(|_| record.progress == 100),
                    error: record.error.clone(),
                };
                // El padre vive siempre en el mismo nodo que sus partes
                self.enqueue_nested(
                    &parent_id,
                    Envelope {
                        home: self.own_addr.clone(),
                        parent_id: None,
                        update: report,
                    },
                );
            }
        }
        Ok(())
    }

    /// Detiene y cancela las partes que siguen abiertas de un padre terminado
    fn abort_open_parts(&self, parent: &JobRecord) {
        let stopper = self.stopper.lock().as_ref().and_then(Weak::upgrade);
        for part in parent.parts.iter().filter(|p| !p.status.is_terminal()) {
            tracing::info!(
                job_id = %parent.id,
                part_id = %part.part_id,
                node = %part.assigned_node,
                status = %parent.status,
                "stopping remaining part"
            );
            if let Some(stopper) = &stopper {
                stopper.stop_execution(&part.part_id);
            }
            self.enqueue_nested(
                &part.part_id,
                Envelope {
                    home: self.own_addr.clone(),
                    parent_id: Some(parent.id.clone()),
                    update: JobUpdate::Cancelled,
                },
            );
        }
    }

    /// Encolar desde dentro de un flush: el buffer del padre es otro job
    fn enqueue_nested(&self, job_id: &str, envelope: Envelope) {
        let mut buffers = self.buffers.lock();
        let buffer = buffers.entry(job_id.to_string()).or_default();
        buffer.pending.push_back(envelope);
        if buffer.in_flight {
            return;
        }
        buffer.in_flight = true;
        drop(buffers);
        self.flush(job_id);
    }
}
