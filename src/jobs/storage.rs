//! # Persistencia de Registros de Jobs
//! src/jobs/storage.rs
//!
//! Colaborador de persistencia del planificador: crear, buscar y guardar
//! registros. La implementación por defecto mantiene un mapa en memoria y lo
//! vuelca completo a un archivo JSON con escritura atómica (tmp + rename).
//!
//! Un `save` que falla no deja rastro: el mapa en memoria solo cambia después
//! de que el archivo se escribió, así un reintento del aggregator parte del
//! mismo estado que el intento fallido.

use crate::error::{ClusterError, Result};
use crate::jobs::types::{JobRecord, JobStatus};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Operaciones que el planificador necesita del almacenamiento
pub trait JobStore: Send + Sync {
    /// Inserta un registro nuevo
    fn create(&self, record: &JobRecord) -> Result<()>;

    fn find(&self, id: &str) -> Option<JobRecord>;

    /// Reemplaza el registro completo (sin escrituras parciales visibles)
    fn save(&self, record: &JobRecord) -> Result<()>;

    fn list(&self) -> Vec<JobRecord>;
}

/// Storage en memoria con volcado opcional a un archivo JSON
pub struct JobStorage {
    /// `None` = solo memoria
    path: Option<PathBuf>,
    jobs: Arc<Mutex<HashMap<String, JobRecord>>>,
}

impl JobStorage {
    /// Abre (o crea) el archivo y carga los registros existentes
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let jobs = if path.exists() {
            Self::load_from_file(&path)?
        } else {
            HashMap::new()
        };

        tracing::info!(path = %path.display(), records = jobs.len(), "job storage opened");
        Ok(Self {
            path: Some(path),
            jobs: Arc::new(Mutex::new(jobs)),
        })
    }

    pub fn in_memory() -> Self {
        Self {
            path: None,
            jobs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn load_from_file(path: &Path) -> Result<HashMap<String, JobRecord>> {
        let reader = BufReader::new(File::open(path)?);
        match serde_json::from_reader(reader) {
            Ok(jobs) => Ok(jobs),
            Err(e) => {
                // Archivo corrupto: se empieza limpio
                tracing::warn!(path = %path.display(), error = %e, "job storage unreadable, starting empty");
                Ok(HashMap::new())
            }
        }
    }

    fn write_file(path: &Path, jobs: &HashMap<String, JobRecord>) -> Result<()> {
        let persist_err = |e: std::io::Error| {
            ClusterError::PersistenceWrite(format!("{}: {}", path.display(), e))
        };

        let temp_path = path.with_extension("json.tmp");
        let file = File::create(&temp_path).map_err(persist_err)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, jobs)
            .map_err(|e| ClusterError::PersistenceWrite(e.to_string()))?;
        writer.flush().map_err(persist_err)?;
        drop(writer);

        fs::rename(&temp_path, path).map_err(persist_err)
    }

    /// Inserta o reemplaza bajo el lock; el mapa solo cambia si el disco aceptó
    fn upsert(&self, record: &JobRecord, must_be_new: bool) -> Result<()> {
        let mut jobs = self.jobs.lock();
        if must_be_new && jobs.contains_key(&record.id) {
            return Err(ClusterError::PersistenceWrite(format!(
                "job {} already exists",
                record.id
            )));
        }

        if let Some(path) = &self.path {
            let mut next = jobs.clone();
            next.insert(record.id.clone(), record.clone());
            Self::write_file(path, &next)?;
            *jobs = next;
        } else {
            jobs.insert(record.id.clone(), record.clone());
        }
        Ok(())
    }

    pub fn count(&self) -> usize {
        self.jobs.lock().len()
    }

    /// Marca como fallidos los jobs que quedaron `Running` tras un reinicio
    ///
    /// Los `Queued` se dejan: su item puede seguir en la cola compartida.
    pub fn fail_interrupted(&self, node_name: &str) -> Result<usize> {
        let interrupted: Vec<JobRecord> = self
            .list()
            .into_iter()
            .filter(|r| r.status == JobStatus::Running && r.owner_node == node_name)
            .collect();

        for mut record in interrupted.iter().cloned() {
            record.error = Some("interrupted by node restart".to_string());
            record.finish(JobStatus::Failed);
            self.save(&record)?;
        }
        Ok(interrupted.len())
    }
}

impl JobStore for JobStorage {
    fn create(&self, record: &JobRecord) -> Result<()> {
        self.upsert(record, true)
    }

    fn find(&self, id: &str) -> Option<JobRecord> {
        self.jobs.lock().get(id).cloned()
    }

    fn save(&self, record: &JobRecord) -> Result<()> {
        self.upsert(record, false)
    }

    fn list(&self) -> Vec<JobRecord> {
        self.jobs.lock().values().cloned().collect()
    }
}

impl Clone for JobStorage {
    fn clone(&self) -> Self {
        Self {
            path: self.path.clone(),
            jobs: Arc::clone(&self.jobs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::types::JobUpdate;
    use tempfile::TempDir;

    fn record(id: &str, n: u64) -> JobRecord {
        JobRecord::single(id, n, "node1")
    }

    #[test]
    fn test_create_find_save() {
        let dir = TempDir::new().unwrap();
        let storage = JobStorage::open(dir.path().join("jobs.json")).unwrap();

        let mut job = record("node1-1", 5);
        storage.create(&job).unwrap();
        assert_eq!(storage.find("node1-1").unwrap().target_number, 5);

        job.apply(JobUpdate::Started { node: "node1".into() });
        storage.save(&job).unwrap();
        assert_eq!(storage.find("node1-1").unwrap().status, JobStatus::Running);
        assert!(storage.find("missing").is_none());
    }

    #[test]
    fn test_create_rejects_duplicates() {
        let storage = JobStorage::in_memory();
        storage.create(&record("a", 1)).unwrap();
        assert!(storage.create(&record("a", 2)).is_err());
        assert_eq!(storage.find("a").unwrap().target_number, 1);
    }

    #[test]
    fn test_records_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data").join("node1-jobs.json");
        {
            let storage = JobStorage::open(&path).unwrap();
            storage.create(&record("persist-1", 30)).unwrap();
        }

        let storage = JobStorage::open(&path).unwrap();
        assert_eq!(storage.count(), 1);
        assert_eq!(storage.find("persist-1").unwrap().range.end, 30);
    }

    #[test]
    fn test_corrupt_file_starts_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("jobs.json");
        fs::write(&path, "{not json").unwrap();

        let storage = JobStorage::open(&path).unwrap();
        assert_eq!(storage.count(), 0);
    }

    #[test]
    fn test_failed_write_leaves_memory_untouched() {
        let dir = TempDir::new().unwrap();
        let sub = dir.path().join("gone");
        let storage = JobStorage::open(sub.join("jobs.json")).unwrap();
        storage.create(&record("a", 3)).unwrap();

        fs::remove_dir_all(&sub).unwrap();

        let mut updated = storage.find("a").unwrap();
        updated.apply(JobUpdate::Cancelled);
        let err = storage.save(&updated).unwrap_err();
        assert!(matches!(err, ClusterError::PersistenceWrite(_)));
        assert!(err.is_transient());
        assert_eq!(storage.find("a").unwrap().status, JobStatus::Queued);
    }

    #[test]
    fn test_fail_interrupted() {
        let storage = JobStorage::in_memory();
        let mut running = record("r", 10);
        running.apply(JobUpdate::Started { node: "node1".into() });
        storage.create(&running).unwrap();
        storage.create(&record("q", 10)).unwrap();

        assert_eq!(storage.fail_interrupted("node1").unwrap(), 1);
        assert_eq!(storage.find("r").unwrap().status, JobStatus::Failed);
        assert_eq!(storage.find("q").unwrap().status, JobStatus::Queued);
    }
}
