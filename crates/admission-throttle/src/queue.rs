use chrono::{DateTime, Utc};
use egress_types::IdentityKey;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use uuid::Uuid;

#[derive(
    Serialize,
    Deserialize,
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    strum::Display,
    strum::EnumString,
)]
pub enum BatchPriority {
    High,
    Normal,
    Low,
}

/// The unit of admission: a group of payload items to be sent through
/// one identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub id: Uuid,
    pub identity: IdentityKey,
    pub payload_items: Vec<String>,
    pub priority: BatchPriority,
    pub created_at: DateTime<Utc>,
    /// Not dequeued before this instant
    pub scheduled_for: DateTime<Utc>,
    pub attempts: u32,
    pub max_attempts: u32,
}

impl Batch {
    pub fn new(
        identity: IdentityKey,
        payload_items: Vec<String>,
        priority: BatchPriority,
        max_attempts: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            identity,
            payload_items,
            priority,
            created_at: now,
            scheduled_for: now,
            attempts: 0,
            max_attempts,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_for <= now
    }
}

/// Three FIFO queues, one per priority, sharing a single capacity.
pub struct BatchQueues {
    high: VecDeque<Batch>,
    normal: VecDeque<Batch>,
    low: VecDeque<Batch>,
    capacity: usize,
}

impl BatchQueues {
    pub fn new(capacity: usize) -> Self {
        Self {
            high: VecDeque::new(),
            normal: VecDeque::new(),
            low: VecDeque::new(),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.high.len() + self.normal.len() + self.low.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }

    fn queue_mut(&mut self, priority: BatchPriority) -> &mut VecDeque<Batch> {
        match priority {
            BatchPriority::High => &mut self.high,
            BatchPriority::Normal => &mut self.normal,
            BatchPriority::Low => &mut self.low,
        }
    }

    /// Append to the back of the batch's priority queue. Returns the
    /// batch back when every queue slot is taken.
    pub fn push(&mut self, batch: Batch) -> Result<(), Batch> {
        if self.is_full() {
            return Err(batch);
        }
        self.queue_mut(batch.priority).push_back(batch);
        Ok(())
    }

    /// Re-insert a batch that was popped but could not be admitted.
    /// It goes to the back of its queue so siblings get a turn.
    pub fn requeue(&mut self, batch: Batch) {
        self.queue_mut(batch.priority).push_back(batch);
    }

    /// Pop the first batch, scanning High then Normal then Low, for
    /// which `admit` says yes. Batches that are not yet due, or do not
    /// match the identity filter, are skipped in place. Batches that
    /// `admit` rejects are handled per its verdict: kept in place
    /// ahead of anything enqueued meanwhile, or dropped.
    pub fn pop_where(
        &mut self,
        now: DateTime<Utc>,
        filter: Option<&IdentityKey>,
        mut admit: impl FnMut(&Batch) -> Verdict,
    ) -> Option<Batch> {
        for priority in [BatchPriority::High, BatchPriority::Normal, BatchPriority::Low] {
            let queue = self.queue_mut(priority);
            let mut passed_over = VecDeque::new();
            let mut admitted = None;

            while let Some(batch) = queue.pop_front() {
                if !batch.is_due(now) || filter.is_some_and(|want| batch.identity != *want) {
                    passed_over.push_back(batch);
                    continue;
                }
                match admit(&batch) {
                    Verdict::Admit => {
                        admitted = Some(batch);
                        break;
                    }
                    Verdict::Requeue => passed_over.push_back(batch),
                    Verdict::Drop => {}
                }
            }

            // Skipped batches keep their relative order ahead of
            // anything enqueued while we scanned
            while let Some(batch) = passed_over.pop_back() {
                queue.push_front(batch);
            }

            if admitted.is_some() {
                return admitted;
            }
        }
        None
    }

    /// Queue depths as (high, normal, low).
    pub fn depths(&self) -> (usize, usize, usize) {
        (self.high.len(), self.normal.len(), self.low.len())
    }

    /// Every queued batch, High first, each queue front-to-back.
    pub fn snapshot(&self) -> Vec<Batch> {
        self.high
            .iter()
            .chain(self.normal.iter())
            .chain(self.low.iter())
            .cloned()
            .collect()
    }

    /// Whether any queue still holds the given batch id.
    pub fn contains(&self, id: Uuid) -> bool {
        self.high
            .iter()
            .chain(self.normal.iter())
            .chain(self.low.iter())
            .any(|batch| batch.id == id)
    }
}

/// What to do with a popped batch that reached the admission check.
pub enum Verdict {
    Admit,
    Requeue,
    Drop,
}
