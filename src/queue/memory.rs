//! In-memory queue implementation
//!
//! Backs tests and single-process runs. Mirrors the dispatch and lease
//! semantics of the sqlite queue exactly; the integration tests run against
//! this implementation.

use std::cmp::Reverse;
use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::work::{LeasedWork, QueuedWork, WorkId, WorkLease};
use super::{EnqueueRequest, QueueDepth, QueueError, WorkQueue};

struct Entry {
    work: QueuedWork,
    /// Insertion order, the final dispatch tie-breaker
    seq: u64,
}

#[derive(Default)]
struct Inner {
    items: HashMap<WorkId, Entry>,
    dead: Vec<(QueuedWork, String)>,
    next_seq: u64,
}

/// Process-local work queue with the durable queue's semantics
#[derive(Default)]
pub struct InMemoryWorkQueue {
    inner: Mutex<Inner>,
}

impl InMemoryWorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Dead-lettered items with their terminal reasons (test observability)
    pub async fn dead_letters(&self) -> Vec<(QueuedWork, String)> {
        self.inner.lock().await.dead.clone()
    }
}

#[async_trait]
impl WorkQueue for InMemoryWorkQueue {
    async fn enqueue(&self, request: EnqueueRequest) -> Result<WorkId, QueueError> {
        let mut inner = self.inner.lock().await;
        let work_id = WorkId::new();
        let seq = inner.next_seq;
        inner.next_seq += 1;

        let now = Utc::now();
        inner.items.insert(
            work_id,
            Entry {
                work: QueuedWork {
                    work_id,
                    task_name: request.task_name,
                    args: request.args,
                    queue: request.queue,
                    priority: request.priority,
                    attempt_no: 0,
                    not_before: request.not_before.unwrap_or(now),
                    enqueued_at: now,
                    lease: None,
                    last_error: None,
                },
                seq,
            },
        );
        Ok(work_id)
    }

    async fn lease(
        &self,
        queues: &[String],
        worker_id: &str,
        lease_ttl: Duration,
    ) -> Result<Option<LeasedWork>, QueueError> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();

        let candidate = inner
            .items
            .values()
            .filter(|entry| queues.contains(&entry.work.queue) && entry.work.is_ready(now))
            .min_by_key(|entry| (Reverse(entry.work.priority.level()), entry.work.not_before, entry.seq))
            .map(|entry| entry.work.work_id);

        let Some(work_id) = candidate else {
            return Ok(None);
        };

        let deadline = now
            + chrono::Duration::from_std(lease_ttl)
                .map_err(|e| QueueError::Unavailable(e.to_string()))?;
        let token = Uuid::new_v4();

        let entry = inner.items.get_mut(&work_id).ok_or(QueueError::NotFound { work_id })?;
        entry.work.lease = Some(WorkLease {
            token,
            worker_id: worker_id.to_string(),
            deadline,
        });

        Ok(Some(LeasedWork {
            work: entry.work.clone(),
            lease_token: token,
            lease_deadline: deadline,
        }))
    }

    async fn extend(&self, work_id: WorkId, lease_token: Uuid, lease_ttl: Duration) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        let entry = inner.items.get_mut(&work_id).ok_or(QueueError::NotFound { work_id })?;

        match &mut entry.work.lease {
            Some(lease) if lease.token == lease_token && !lease.is_expired(now) => {
                lease.deadline = now
                    + chrono::Duration::from_std(lease_ttl)
                        .map_err(|e| QueueError::Unavailable(e.to_string()))?;
                Ok(())
            }
            _ => Err(QueueError::StaleLease { work_id }),
        }
    }

    async fn ack(&self, work_id: WorkId, lease_token: Uuid) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        let holds_lease = inner
            .items
            .get(&work_id)
            .ok_or(QueueError::StaleLease { work_id })?
            .work
            .lease
            .as_ref()
            .map_or(false, |l| l.token == lease_token && !l.is_expired(now));

        if !holds_lease {
            return Err(QueueError::StaleLease { work_id });
        }
        inner.items.remove(&work_id);
        Ok(())
    }

    async fn nack(
        &self,
        work_id: WorkId,
        lease_token: Uuid,
        reason: &str,
        delay: Duration,
    ) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        let entry = inner.items.get_mut(&work_id).ok_or(QueueError::StaleLease { work_id })?;

        let holds_lease = entry
            .work
            .lease
            .as_ref()
            .map_or(false, |l| l.token == lease_token && !l.is_expired(now));
        if !holds_lease {
            return Err(QueueError::StaleLease { work_id });
        }

        entry.work.lease = None;
        entry.work.attempt_no += 1;
        entry.work.last_error = Some(reason.to_string());
        entry.work.not_before = now
            + chrono::Duration::from_std(delay).map_err(|e| QueueError::Unavailable(e.to_string()))?;
        Ok(())
    }

    async fn fail(&self, work_id: WorkId, lease_token: Uuid, reason: &str) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        let holds_lease = inner
            .items
            .get(&work_id)
            .ok_or(QueueError::StaleLease { work_id })?
            .work
            .lease
            .as_ref()
            .map_or(false, |l| l.token == lease_token && !l.is_expired(now));

        if !holds_lease {
            return Err(QueueError::StaleLease { work_id });
        }

        let mut entry = inner.items.remove(&work_id).expect("checked above");
        entry.work.lease = None;
        entry.work.last_error = Some(reason.to_string());
        inner.dead.push((entry.work, reason.to_string()));
        Ok(())
    }

    async fn depth(&self, queue: &str) -> Result<u64, QueueError> {
        let inner = self.inner.lock().await;
        let now = Utc::now();
        Ok(inner
            .items
            .values()
            .filter(|e| e.work.queue == queue && e.work.is_ready(now))
            .count() as u64)
    }

    async fn depths(&self) -> Result<Vec<QueueDepth>, QueueError> {
        let inner = self.inner.lock().await;
        let now = Utc::now();

        let mut buckets: HashMap<(String, super::Priority), (u64, u64)> = HashMap::new();
        for entry in inner.items.values() {
            let slot = buckets
                .entry((entry.work.queue.clone(), entry.work.priority))
                .or_default();
            if entry.work.is_ready(now) {
                slot.0 += 1;
            } else if entry.work.lease.as_ref().map_or(false, |l| !l.is_expired(now)) {
                slot.1 += 1;
            }
        }

        let mut depths: Vec<QueueDepth> = buckets
            .into_iter()
            .map(|((queue, priority), (ready, leased))| QueueDepth { queue, priority, ready, leased })
            .collect();
        depths.sort_by(|a, b| (a.queue.clone(), Reverse(a.priority.level())).cmp(&(b.queue.clone(), Reverse(b.priority.level()))));
        Ok(depths)
    }

    async fn find(&self, work_id: WorkId) -> Result<Option<QueuedWork>, QueueError> {
        let inner = self.inner.lock().await;
        Ok(inner.items.get(&work_id).map(|e| e.work.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::super::Priority;
    use super::*;
    use serde_json::json;

    fn request(task: &str, queue: &str, priority: Priority) -> EnqueueRequest {
        EnqueueRequest::new(task, json!({})).on_queue(queue).with_priority(priority)
    }

    #[tokio::test]
    async fn dispatch_prefers_priority_then_insertion_order() {
        let queue = InMemoryWorkQueue::new();
        let queues = vec!["crawler".to_string()];

        queue.enqueue(request("a", "crawler", Priority::Normal)).await.unwrap();
        queue.enqueue(request("b", "crawler", Priority::Urgent)).await.unwrap();
        queue.enqueue(request("c", "crawler", Priority::Normal)).await.unwrap();

        let first = queue.lease(&queues, "w", Duration::from_secs(30)).await.unwrap().unwrap();
        assert_eq!(first.work.task_name, "b");

        let second = queue.lease(&queues, "w", Duration::from_secs(30)).await.unwrap().unwrap();
        assert_eq!(second.work.task_name, "a");
    }

    #[tokio::test]
    async fn queues_are_isolated() {
        let queue = InMemoryWorkQueue::new();
        queue.enqueue(request("img", "image", Priority::Urgent)).await.unwrap();

        let leased = queue
            .lease(&["crawler".to_string()], "w", Duration::from_secs(30))
            .await
            .unwrap();
        assert!(leased.is_none());
    }

    #[tokio::test]
    async fn double_ack_is_rejected() {
        let queue = InMemoryWorkQueue::new();
        let queues = vec!["default".to_string()];
        queue.enqueue(request("t", "default", Priority::Normal)).await.unwrap();

        let leased = queue.lease(&queues, "w", Duration::from_secs(30)).await.unwrap().unwrap();
        queue.ack(leased.work.work_id, leased.lease_token).await.unwrap();

        let err = queue.ack(leased.work.work_id, leased.lease_token).await.unwrap_err();
        assert!(matches!(err, QueueError::StaleLease { .. }));
    }

    #[tokio::test]
    async fn expired_lease_is_releasable_and_old_token_stale() {
        let queue = InMemoryWorkQueue::new();
        let queues = vec!["default".to_string()];
        queue.enqueue(request("t", "default", Priority::Normal)).await.unwrap();

        let first = queue.lease(&queues, "w1", Duration::from_millis(10)).await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let second = queue.lease(&queues, "w2", Duration::from_secs(30)).await.unwrap().unwrap();
        assert_eq!(first.work.work_id, second.work.work_id);

        let err = queue.ack(first.work.work_id, first.lease_token).await.unwrap_err();
        assert!(matches!(err, QueueError::StaleLease { .. }));

        queue.ack(second.work.work_id, second.lease_token).await.unwrap();
    }

    #[tokio::test]
    async fn nack_delays_and_bumps_attempt() {
        let queue = InMemoryWorkQueue::new();
        let queues = vec!["default".to_string()];
        queue.enqueue(request("t", "default", Priority::Normal)).await.unwrap();

        let leased = queue.lease(&queues, "w", Duration::from_secs(30)).await.unwrap().unwrap();
        queue
            .nack(leased.work.work_id, leased.lease_token, "TooManyRequests", Duration::from_secs(60))
            .await
            .unwrap();

        // Not eligible again until the delay elapses
        assert!(queue.lease(&queues, "w", Duration::from_secs(30)).await.unwrap().is_none());

        let parked = queue.find(leased.work.work_id).await.unwrap().unwrap();
        assert_eq!(parked.attempt_no, 1);
        assert_eq!(parked.last_error.as_deref(), Some("TooManyRequests"));
    }

    #[tokio::test]
    async fn fail_moves_to_dead_letter() {
        let queue = InMemoryWorkQueue::new();
        let queues = vec!["default".to_string()];
        queue.enqueue(request("t", "default", Priority::Normal)).await.unwrap();

        let leased = queue.lease(&queues, "w", Duration::from_secs(30)).await.unwrap().unwrap();
        queue.fail(leased.work.work_id, leased.lease_token, "Malformed").await.unwrap();

        assert_eq!(queue.depth("default").await.unwrap(), 0);
        let dead = queue.dead_letters().await;
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].1, "Malformed");
    }
}
