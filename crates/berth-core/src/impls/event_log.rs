//! InMemoryEventLog - 追記専用の診断ログ

use std::sync::{Arc, Mutex};

use crate::domain::{DomainEvent, EventRecord};
use crate::ports::{Clock, EventSink, SystemClock};

/// 追記専用。読み出しはスナップショットを返す。
pub struct InMemoryEventLog {
    records: Mutex<Vec<EventRecord>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryEventLog {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            clock,
        }
    }

    pub fn snapshot(&self) -> Vec<EventRecord> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn events(&self) -> Vec<DomainEvent> {
        self.snapshot().into_iter().map(|r| r.event).collect()
    }

    pub fn len(&self) -> usize {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryEventLog {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for InMemoryEventLog {
    fn emit(&self, event: DomainEvent) {
        let record = EventRecord {
            at: self.clock.now(),
            event,
        };
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(record);
    }
}
