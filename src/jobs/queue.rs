//! # Cola de Desborde Compartida
//! src/jobs/queue.rs
//!
//! Cola FIFO de [`WorkItem`] que absorbe el trabajo que no encontró slot
//! libre. Un solo nodo la aloja ([`LocalQueue`]) y la expone por HTTP en
//! `/queue/*`; el otro nodo la usa a través de [`RemoteQueue`]. El pop es
//! atómico porque siempre lo resuelve el mutex del nodo que la aloja.

use crate::error::{ClusterError, Result};
use crate::http::HttpClient;
use crate::jobs::types::WorkItem;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Contrato de la cola: push al final, pop del más antiguo
pub trait OverflowQueue: Send + Sync {
    /// Encola al final y retorna el largo resultante (la posición del item)
    fn push(&self, item: WorkItem) -> Result<usize>;

    fn pop_oldest(&self) -> Result<Option<WorkItem>>;

    fn len(&self) -> Result<usize>;

    /// Quita un item que aún no empezó; `false` si no estaba
    fn remove(&self, job_id: &str) -> Result<bool>;
}

/// Cola alojada en este proceso
pub struct LocalQueue {
    items: Mutex<VecDeque<WorkItem>>,
    capacity: usize,
}

impl LocalQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Ids en orden de salida
    pub fn snapshot_ids(&self) -> Vec<String> {
        self.items.lock().iter().map(|i| i.job_id.clone()).collect()
    }
}

impl OverflowQueue for LocalQueue {
    fn push(&self, item: WorkItem) -> Result<usize> {
        let mut items = self.items.lock();
        if items.len() >= self.capacity {
            return Err(ClusterError::QueueFull(self.capacity));
        }
        tracing::debug!(job_id = %item.job_id, position = items.len() + 1, "work item queued");
        items.push_back(item);
        Ok(items.len())
    }

    fn pop_oldest(&self) -> Result<Option<WorkItem>> {
        Ok(self.items.lock().pop_front())
    }

    fn len(&self) -> Result<usize> {
        Ok(self.items.lock().len())
    }

    fn remove(&self, job_id: &str) -> Result<bool> {
        let mut items = self.items.lock();
        match items.iter().position(|i| i.job_id == job_id) {
            Some(idx) => {
                items.remove(idx);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueLength {
    pub length: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoveRequest {
    pub job_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoveAck {
    pub removed: bool,
}

/// Cola alojada en el otro nodo
pub struct RemoteQueue {
    host: String,
    client: HttpClient,
}

impl RemoteQueue {
    pub fn new(host: impl Into<String>, client: HttpClient) -> Self {
        Self {
            host: host.into(),
            client,
        }
    }
}

impl OverflowQueue for RemoteQueue {
    fn push(&self, item: WorkItem) -> Result<usize> {
        let ack: QueueLength = self.client.post_json(&self.host, "/queue/push", &item)?;
        Ok(ack.length)
    }

    fn pop_oldest(&self) -> Result<Option<WorkItem>> {
        self.client
            .post_json(&self.host, "/queue/pop", &serde_json::Value::Null)
    }

    fn len(&self) -> Result<usize> {
        let reply: QueueLength = self.client.get_json(&self.host, "/queue/len")?;
        Ok(reply.length)
    }

    fn remove(&self, job_id: &str) -> Result<bool> {
        let ack: RemoveAck = self.client.post_json(
            &self.host,
            "/queue/remove",
            &RemoveRequest {
                job_id: job_id.to_string(),
            },
        )?;
        Ok(ack.removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::types::{JobRecord, WorkItem};
    use std::sync::Arc;
    use std::thread;

    fn item(id: &str) -> WorkItem {
        WorkItem::from_record(&JobRecord::single(id, 5, "node1"), "127.0.0.1:8001")
    }

    #[test]
    fn test_fifo_order() {
        let queue = LocalQueue::new(10);
        assert_eq!(queue.push(item("a")).unwrap(), 1);
        assert_eq!(queue.push(item("b")).unwrap(), 2);
        assert_eq!(queue.push(item("c")).unwrap(), 3);

        assert_eq!(queue.pop_oldest().unwrap().unwrap().job_id, "a");
        assert_eq!(queue.pop_oldest().unwrap().unwrap().job_id, "b");
        assert_eq!(queue.pop_oldest().unwrap().unwrap().job_id, "c");
        assert!(queue.pop_oldest().unwrap().is_none());
    }

    #[test]
    fn test_capacity() {
        let queue = LocalQueue::new(2);
        queue.push(item("1")).unwrap();
        queue.push(item("2")).unwrap();
        assert!(matches!(
            queue.push(item("3")),
            Err(ClusterError::QueueFull(2))
        ));
        assert_eq!(queue.len().unwrap(), 2);
    }

    #[test]
    fn test_remove_keeps_order() {
        let queue = LocalQueue::new(10);
        for id in ["a", "b", "c"] {
            queue.push(item(id)).unwrap();
        }
        assert!(queue.remove("b").unwrap());
        assert!(!queue.remove("b").unwrap());
        assert_eq!(queue.snapshot_ids(), vec!["a", "c"]);
    }

    #[test]
    fn test_concurrent_pushes_keep_per_producer_order() {
        let queue = Arc::new(LocalQueue::new(1000));
        let producers: Vec<_> = ["node1", "node2"]
            .into_iter()
            .map(|node| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || {
                    for i in 0..100 {
                        queue.push(item(&format!("{}-{}", node, i))).unwrap();
                    }
                })
            })
            .collect();
        for p in producers {
            p.join().unwrap();
        }

        let mut last = [None::<u32>, None::<u32>];
        while let Some(popped) = queue.pop_oldest().unwrap() {
            let (node, seq) = popped.job_id.split_once('-').unwrap();
            let slot = if node == "node1" { 0 } else { 1 };
            let seq: u32 = seq.parse().unwrap();
            if let Some(prev) = last[slot] {
                assert!(seq > prev, "{} popped out of order", popped.job_id);
            }
            last[slot] = Some(seq);
        }
        assert_eq!(last, [Some(99), Some(99)]);
    }

    #[test]
    fn test_remote_queue_unreachable() {
        let addr = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().to_string()
        };
        let queue = RemoteQueue::new(
            addr,
            HttpClient::new("node2", std::time::Duration::from_millis(200)),
        );
        assert!(matches!(
            queue.push(item("x")),
            Err(ClusterError::PeerUnreachable { .. })
        ));
    }
}
