//! Live event fan-out and cursor paging helpers.
//!
//! Persisted events are the source of truth. The bus only carries events
//! appended by this process, so a subscriber that lags re-reads from its
//! last seen sequence through the cursor API.

use futures::{Stream, StreamExt};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use uuid::Uuid;

use crate::error::QueueError;
use crate::queue::model::JobEvent;

/// Default page size for event and artifact reads.
pub const DEFAULT_PAGE_LIMIT: u32 = 200;

/// Largest page size for event and artifact reads.
pub const MAX_PAGE_LIMIT: u32 = 500;

const BUS_CAPACITY: usize = 1024;

/// Item yielded by a job event subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum EventUpdate {
    Event(JobEvent),
    /// Some events were dropped. Re-read after the last seen sequence.
    Lagged(u64),
}

/// In-process broadcast of newly appended events.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<JobEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    /// Publish an event. No subscribers is not an error.
    pub fn publish(&self, event: JobEvent) {
        let _ = self.tx.send(event);
    }

    /// Raw receiver across all jobs.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.tx.subscribe()
    }

    /// Stream of events for one job.
    pub fn stream(&self, job_id: Uuid) -> impl Stream<Item = EventUpdate> + Send + use<> {
        BroadcastStream::new(self.tx.subscribe()).filter_map(move |item| async move {
            match item {
                Ok(event) if event.job_id == job_id => Some(EventUpdate::Event(event)),
                Ok(_) => None,
                Err(BroadcastStreamRecvError::Lagged(n)) => Some(EventUpdate::Lagged(n)),
            }
        })
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Validate a requested page size against `1..=max`, applying the default.
pub fn page_limit(limit: Option<u32>, default: u32, max: u32) -> Result<u32, QueueError> {
    match limit {
        None => Ok(default),
        Some(n) if (1..=max).contains(&n) => Ok(n),
        Some(n) => Err(QueueError::Validation(format!(
            "limit must be between 1 and {max}, got {n}"
        ))),
    }
}

/// Cursor for the page following `events`.
pub fn next_cursor(events: &[JobEvent], after: Option<i64>) -> Option<i64> {
    events.last().map(|e| e.sequence).or(after)
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::queue::model::EventLevel;

    fn event(job_id: Uuid, sequence: i64) -> JobEvent {
        JobEvent {
            id: Uuid::new_v4(),
            job_id,
            sequence,
            level: EventLevel::Info,
            message: format!("event {sequence}"),
            payload: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn stream_filters_by_job() {
        let bus = EventBus::new();
        let job = Uuid::new_v4();
        let other = Uuid::new_v4();
        let mut stream = Box::pin(bus.stream(job));

        bus.publish(event(other, 1));
        bus.publish(event(job, 1));
        bus.publish(event(job, 2));

        let first = stream.next().await.unwrap();
        let second = stream.next().await.unwrap();
        match (first, second) {
            (EventUpdate::Event(a), EventUpdate::Event(b)) => {
                assert_eq!(a.job_id, job);
                assert_eq!((a.sequence, b.sequence), (1, 2));
            }
            other => panic!("unexpected updates: {other:?}"),
        }
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_fine() {
        let bus = EventBus::new();
        bus.publish(event(Uuid::new_v4(), 1));
    }

    #[test]
    fn page_limit_bounds() {
        assert_eq!(page_limit(None, 200, 500).unwrap(), 200);
        assert_eq!(page_limit(Some(1), 200, 500).unwrap(), 1);
        assert_eq!(page_limit(Some(500), 200, 500).unwrap(), 500);
        assert!(page_limit(Some(0), 200, 500).is_err());
        assert!(page_limit(Some(501), 200, 500).is_err());
    }

    #[test]
    fn next_cursor_falls_back_to_after() {
        let job = Uuid::new_v4();
        assert_eq!(next_cursor(&[], Some(7)), Some(7));
        assert_eq!(next_cursor(&[event(job, 8), event(job, 9)], Some(7)), Some(9));
        assert_eq!(next_cursor(&[], None), None);
    }
}
