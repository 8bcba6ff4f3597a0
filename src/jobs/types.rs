//! # Tipos del Sistema de Jobs
//! src/jobs/types.rs
//!
//! Tipos compartidos por todo el planificador: el registro de un job, sus
//! estados, los rangos de multiplicación, los valores de precisión
//! arbitraria y los mensajes de actualización que fluyen por el aggregator.
//!
//! Todo lo que viaja por HTTP o se guarda en disco usa camelCase y los
//! enteros grandes se serializan como strings decimales.

use num_bigint::BigUint;
use num_traits::One;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Cuántos pasos del executor guarda cada registro
pub const MAX_STEPS: usize = 20;

/// Cuántos pasos se devuelven en una consulta de progreso
pub const VIEW_STEPS: usize = 5;

/// Milisegundos desde epoch
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Tipo de job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    /// Un solo rango `[1, N]` ejecutado por un executor
    Single,
    /// Sub-rango de un job distribuido
    Part,
    /// Padre que coordina dos partes; nunca ejecuta
    Distributed,
}

/// Estado del ciclo de vida
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rango inclusivo `[start, end]` de factores a multiplicar
///
/// Un rango con `end < start` está vacío (es el caso de `0!`) y su producto es 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactorRange {
    pub start: u64,
    pub end: u64,
}

impl FactorRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    /// Rango completo de `n!`
    pub fn for_target(n: u64) -> Self {
        Self { start: 1, end: n }
    }

    /// Cantidad de factores del rango
    pub fn width(&self) -> u64 {
        if self.end >= self.start {
            self.end - self.start + 1
        } else {
            0
        }
    }

    pub fn is_empty(&self) -> bool {
        self.width() == 0
    }

    /// Divide en dos mitades contiguas en `mid = start - 1 + width/2`
    ///
    /// Para `[1, N]` el corte queda en `floor(N/2)`.
    ///
    /// ```
    /// use factorial_cluster::jobs::FactorRange;
    ///
    /// let (a, b) = FactorRange::for_target(100).split_half();
    /// assert_eq!((a.start, a.end), (1, 50));
    /// assert_eq!((b.start, b.end), (51, 100));
    /// ```
    pub fn split_half(&self) -> (FactorRange, FactorRange) {
        let mid = self.start - 1 + self.width() / 2;
        (
            FactorRange::new(self.start, mid),
            FactorRange::new(mid + 1, self.end),
        )
    }

    /// Producto de todos los factores del rango
    pub fn product(&self) -> BigUint {
        (self.start..=self.end).fold(BigUint::one(), |acc, k| acc * k)
    }
}

impl fmt::Display for FactorRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.start, self.end)
    }
}

/// Entero sin signo de precisión arbitraria, serializado como string decimal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BigValue(pub BigUint);

impl BigValue {
    pub fn one() -> Self {
        BigValue(BigUint::one())
    }

    pub fn as_biguint(&self) -> &BigUint {
        &self.0
    }
}

impl From<BigUint> for BigValue {
    fn from(value: BigUint) -> Self {
        BigValue(value)
    }
}

impl fmt::Display for BigValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for BigValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_str_radix(10))
    }
}

impl<'de> Deserialize<'de> for BigValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        BigUint::parse_bytes(text.as_bytes(), 10)
            .map(BigValue)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid decimal integer: {}", text)))
    }
}

/// Entrada del log de pasos
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepEntry {
    pub node: String,
    pub step: String,
}

/// Resumen de una parte dentro de un job distribuido
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartInfo {
    pub part_id: String,
    pub range: FactorRange,
    pub assigned_node: String,
    pub progress: u8,
    pub result: Option<BigValue>,
    pub status: JobStatus,
}

/// Registro persistente de un job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub id: String,
    pub kind: JobKind,
    /// El N pedido por el cliente (para partes, el N del padre)
    pub target_number: u64,
    pub range: FactorRange,
    pub initial_accumulator: BigValue,
    pub status: JobStatus,
    pub progress: u8,
    pub accumulated_result: Option<BigValue>,
    pub parent_id: Option<String>,
    #[serde(default)]
    pub parts: Vec<PartInfo>,
    pub owner_node: String,
    pub created_at_ms: u64,
    pub started_at_ms: Option<u64>,
    pub finished_at_ms: Option<u64>,
    pub error: Option<String>,
    #[serde(default)]
    pub steps: Vec<StepEntry>,
}

/// Actualización que se aplica a un registro, siempre a través del aggregator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum JobUpdate {
    /// Un executor arrancó en `node`
    Started { node: String },
    Progress {
        node: String,
        percent: u8,
        value: Option<BigValue>,
        step: Option<String>,
    },
    Completed { node: String, result: BigValue },
    Failed { reason: String },
    Cancelled,
    /// Estado de una parte reportado a su padre
    PartReport {
        part_id: String,
        status: JobStatus,
        percent: u8,
        result: Option<BigValue>,
        error: Option<String>,
    },
    /// La parte quedó asignada a otro nodo (o volvió al local tras un fallback)
    PartAssigned { part_id: String, node: String },
}

impl JobUpdate {
    pub fn name(&self) -> &'static str {
        match self {
            JobUpdate::Started { .. } => "started",
            JobUpdate::Progress { .. } => "progress",
            JobUpdate::Completed { .. } => "completed",
            JobUpdate::Failed { .. } => "failed",
            JobUpdate::Cancelled => "cancelled",
            JobUpdate::PartReport { .. } => "part_report",
            JobUpdate::PartAssigned { .. } => "part_assigned",
        }
    }

    /// Updates que dejan un job (o una parte) en estado terminal
    pub fn is_final(&self) -> bool {
        match self {
            JobUpdate::Completed { .. } | JobUpdate::Failed { .. } | JobUpdate::Cancelled => true,
            JobUpdate::PartReport { status, .. } => status.is_terminal(),
            _ => false,
        }
    }
}

/// Resultado de aplicar un update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// El job ya era terminal; el update se descarta
    IgnoredTerminal,
    /// Cancelación repetida sobre un job ya cancelado
    IdempotentCancel,
}

impl JobRecord {
    fn base(id: String, kind: JobKind, target: u64, range: FactorRange, owner: &str) -> Self {
        Self {
            id,
            kind,
            target_number: target,
            range,
            initial_accumulator: BigValue::one(),
            status: JobStatus::Queued,
            progress: 0,
            accumulated_result: None,
            parent_id: None,
            parts: Vec::new(),
            owner_node: owner.to_string(),
            created_at_ms: now_ms(),
            started_at_ms: None,
            finished_at_ms: None,
            error: None,
            steps: Vec::new(),
        }
    }

    /// Job `[1, n]` en un solo executor
    pub fn single(id: impl Into<String>, n: u64, owner: &str) -> Self {
        Self::base(id.into(), JobKind::Single, n, FactorRange::for_target(n), owner)
    }

    pub fn part(
        id: impl Into<String>,
        parent_id: &str,
        target: u64,
        range: FactorRange,
        owner: &str,
    ) -> Self {
        let mut record = Self::base(id.into(), JobKind::Part, target, range, owner);
        record.parent_id = Some(parent_id.to_string());
        record
    }

    /// Padre coordinador; arranca en `Running` porque sus partes ya existen
    pub fn distributed(id: impl Into<String>, n: u64, owner: &str, parts: Vec<PartInfo>) -> Self {
        let mut record = Self::base(id.into(), JobKind::Distributed, n, FactorRange::for_target(n), owner);
        record.status = JobStatus::Running;
        record.started_at_ms = Some(record.created_at_ms);
        record.parts = parts;
        record
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub(crate) fn push_step(&mut self, node: &str, step: String) {
        self.steps.push(StepEntry {
            node: node.to_string(),
            step,
        });
        if self.steps.len() > MAX_STEPS {
            let excess = self.steps.len() - MAX_STEPS;
            self.steps.drain(..excess);
        }
    }

    pub(crate) fn finish(&mut self, status: JobStatus) {
        self.status = status;
        self.finished_at_ms = Some(now_ms());
    }

    /// Aplica un update respetando el ciclo de vida
    ///
    /// - Un job terminal no acepta nada, salvo una cancelación repetida que
    ///   es un no-op.
    /// - El progreso nunca baja y solo llega a 100 con `Completed`.
    /// - Cancelar o fallar conserva el progreso alcanzado.
    pub fn apply(&mut self, update: JobUpdate) -> ApplyOutcome {
        if self.is_terminal() {
            return match (&update, self.status) {
                (JobUpdate::Cancelled, JobStatus::Cancelled) => ApplyOutcome::IdempotentCancel,
                _ => ApplyOutcome::IgnoredTerminal,
            };
        }

        match update {
            JobUpdate::Started { node } => {
                self.status = JobStatus::Running;
                self.owner_node = node.clone();
                if self.started_at_ms.is_none() {
                    self.started_at_ms = Some(now_ms());
                }
                self.push_step(&node, "started".to_string());
            }
            JobUpdate::Progress {
                node,
                percent,
                value,
                step,
            } => {
                if self.status == JobStatus::Queued {
                    self.status = JobStatus::Running;
                }
                self.progress = self.progress.max(percent.min(99));
                if value.is_some() {
                    self.accumulated_result = value;
                }
                if let Some(step) = step {
                    self.push_step(&node, step);
                }
            }
            JobUpdate::Completed { node, result } => {
                self.progress = 100;
                self.accumulated_result = Some(result);
                self.push_step(&node, "done".to_string());
                self.finish(JobStatus::Completed);
            }
            JobUpdate::Failed { reason } => {
                self.error = Some(reason);
                self.finish(JobStatus::Failed);
            }
            JobUpdate::Cancelled => {
                self.finish(JobStatus::Cancelled);
            }
            JobUpdate::PartReport {
                part_id,
                status,
                percent,
                result,
                error,
            } => {
                crate::jobs::coordinator::apply_part_report(
                    self, &part_id, status, percent, result, error,
                );
            }
            JobUpdate::PartAssigned { part_id, node } => {
                if let Some(part) = self.parts.iter_mut().find(|p| p.part_id == part_id) {
                    part.assigned_node = node;
                }
            }
        }
        ApplyOutcome::Applied
    }

    /// Vista para consultas de progreso
    pub fn to_view(&self) -> ProgressView {
        let skip = self.steps.len().saturating_sub(VIEW_STEPS);
        ProgressView {
            job_id: self.id.clone(),
            kind: self.kind,
            state: self.status,
            progress_percent: self.progress,
            target_number: self.target_number,
            range: self.range,
            current_or_final_result: self.accumulated_result.as_ref().map(|v| v.to_string()),
            owner_node: self.owner_node.clone(),
            parent_id: self.parent_id.clone(),
            parts: if self.kind == JobKind::Distributed {
                Some(
                    self.parts
                        .iter()
                        .map(|p| PartView {
                            part_id: p.part_id.clone(),
                            range: p.range,
                            assigned_node: p.assigned_node.clone(),
                            progress_percent: p.progress,
                            state: p.status,
                            result: p.result.as_ref().map(|v| v.to_string()),
                        })
                        .collect(),
                )
            } else {
                None
            },
            error: self.error.clone(),
            steps: self.steps[skip..].to_vec(),
            created_at_ms: self.created_at_ms,
            started_at_ms: self.started_at_ms,
            finished_at_ms: self.finished_at_ms,
        }
    }
}

/// Respuesta de `GET /jobs/progress`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressView {
    pub job_id: String,
    pub kind: JobKind,
    pub state: JobStatus,
    pub progress_percent: u8,
    pub target_number: u64,
    pub range: FactorRange,
    pub current_or_final_result: Option<String>,
    pub owner_node: String,
    pub parent_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub parts: Option<Vec<PartView>>,
    pub error: Option<String>,
    pub steps: Vec<StepEntry>,
    pub created_at_ms: u64,
    pub started_at_ms: Option<u64>,
    pub finished_at_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartView {
    pub part_id: String,
    pub range: FactorRange,
    pub assigned_node: String,
    pub progress_percent: u8,
    pub state: JobStatus,
    pub result: Option<String>,
}

/// Descriptor de trabajo ejecutable que circula por la cola compartida
///
/// `home` es la dirección del nodo dueño del registro: quien ejecute el item
/// le reporta ahí cada update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkItem {
    pub job_id: String,
    pub kind: JobKind,
    pub range: FactorRange,
    pub seed: BigValue,
    pub parent_id: Option<String>,
    pub home: String,
    pub origin_node: String,
    pub enqueued_at_ms: u64,
}

impl WorkItem {
    /// Item ejecutable a partir de un registro `Single` o `Part`
    pub fn from_record(record: &JobRecord, home: &str) -> Self {
        Self {
            job_id: record.id.clone(),
            kind: record.kind,
            range: record.range,
            seed: record.initial_accumulator.clone(),
            parent_id: record.parent_id.clone(),
            home: home.to_string(),
            origin_node: record.owner_node.clone(),
            enqueued_at_ms: now_ms(),
        }
    }
}
