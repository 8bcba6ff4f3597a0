//! # Sistema de Jobs
//! src/jobs/mod.rs
//!
//! Planificación y ejecución distribuida de jobs de factorial entre dos nodos.
//!
//! ```text
//! submit ──► Coordinator (N > umbral) ──► partes ──┐
//!        └─► Scheduler ◄──────────────────────────┘
//!               │ slot libre → Executor (thread)
//!               │ sin slot   → OverflowQueue (compartida)
//!               ▼
//!          Aggregator (un escritor por job) ──► JobStore / nodo dueño
//! ```
//!
//! ## Endpoints
//!
//! - `POST /jobs/submit` - Admitir un job (`{"targetNumber": N}` o `?number=N`)
//! - `GET /jobs/progress?id=JOBID` - Progreso y resultado
//! - `POST /jobs/cancel?id=JOBID` - Cancelar (idempotente)
//! - `GET /jobs/history` - Jobs recientes

pub mod aggregator;
pub mod coordinator;
pub mod executor;
pub mod handlers;
pub mod peer;
pub mod queue;
pub mod scheduler;
pub mod storage;
pub mod types;

pub use aggregator::Aggregator;
pub use coordinator::Coordinator;
pub use queue::{LocalQueue, OverflowQueue, RemoteQueue};
pub use scheduler::{Admission, Scheduler};
pub use storage::{JobStorage, JobStore};
pub use types::{BigValue, FactorRange, JobKind, JobRecord, JobStatus, JobUpdate, ProgressView, WorkItem};
