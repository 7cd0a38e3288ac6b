//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tidemark::aggregate::Aggregate;
use tidemark::errors::ApplyError;
use tidemark::event::{DomainEvent, StoredEvent};
use tidemark::projection::{ErrorHandling, Projection};
use tidemark::session::Session;
use tidemark::types::{ProjectionName, StreamKey};
use tidemark_memory::InMemoryStore;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LedgerEvent {
    Deposited { amount: u64 },
    Withdrawn { amount: u64 },
}

impl DomainEvent for LedgerEvent {
    fn kind(&self) -> &'static str {
        match self {
            Self::Deposited { .. } => "deposited",
            Self::Withdrawn { .. } => "withdrawn",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub balance: i64,
    pub entries: u64,
}

impl Aggregate for Account {
    type Event = LedgerEvent;
    const TYPE_NAME: &'static str = "Account";

    fn apply(&mut self, event: &LedgerEvent) {
        match event {
            LedgerEvent::Deposited { amount } => self.balance += *amount as i64,
            LedgerEvent::Withdrawn { amount } => self.balance -= *amount as i64,
        }
        self.entries += 1;
    }
}

pub type Store = InMemoryStore<LedgerEvent>;

pub fn key(s: &str) -> StreamKey {
    StreamKey::try_new(s).unwrap()
}

pub fn projection_name(s: &str) -> ProjectionName {
    ProjectionName::try_new(s).unwrap()
}

/// Starts a stream with `count` one-unit deposits and flushes.
pub async fn seed_stream(store: &Arc<Store>, stream: &str, count: usize) {
    let mut session = Session::new(Arc::clone(store));
    session.start_stream(
        key(stream),
        (0..count).map(|_| LedgerEvent::Deposited { amount: 1 }),
    );
    session.save_changes().await.unwrap();
}

/// Appends `count` one-unit deposits to an existing stream and flushes.
pub async fn append_to_stream(store: &Arc<Store>, stream: &str, count: usize) {
    let mut session = Session::new(Arc::clone(store));
    session.append(
        key(stream),
        (0..count).map(|_| LedgerEvent::Deposited { amount: 1 }),
    );
    session.save_changes().await.unwrap();
}

/// A projection that tallies applied events, with optional per-stream
/// failures for exercising the dead-letter and strict paths.
pub struct TallyProjection {
    name: ProjectionName,
    shards: u16,
    error_handling: ErrorHandling,
    /// Streams whose events always fail to apply.
    poison: Vec<StreamKey>,
    applied: Mutex<Vec<StoredEvent<LedgerEvent>>>,
}

impl TallyProjection {
    pub fn new(name: &str) -> Self {
        Self {
            name: projection_name(name),
            shards: 1,
            error_handling: ErrorHandling::DeadLetter,
            poison: Vec::new(),
            applied: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn with_shards(mut self, shards: u16) -> Self {
        self.shards = shards;
        self
    }

    #[must_use]
    pub fn with_error_handling(mut self, error_handling: ErrorHandling) -> Self {
        self.error_handling = error_handling;
        self
    }

    #[must_use]
    pub fn poisoned_by(mut self, stream: StreamKey) -> Self {
        self.poison.push(stream);
        self
    }

    pub fn applied_count(&self) -> usize {
        self.applied.lock().unwrap().len()
    }

    pub fn applied_events(&self) -> Vec<StoredEvent<LedgerEvent>> {
        self.applied.lock().unwrap().clone()
    }

    /// Count of applied events per stream.
    pub fn per_stream(&self) -> HashMap<StreamKey, usize> {
        let mut counts = HashMap::new();
        for event in self.applied.lock().unwrap().iter() {
            *counts.entry(event.stream.clone()).or_insert(0) += 1;
        }
        counts
    }
}

#[async_trait]
impl Projection for TallyProjection {
    type Event = LedgerEvent;

    fn name(&self) -> ProjectionName {
        self.name.clone()
    }

    fn shard_count(&self) -> u16 {
        self.shards
    }

    fn error_handling(&self) -> ErrorHandling {
        self.error_handling
    }

    async fn apply(&self, event: &StoredEvent<LedgerEvent>) -> Result<(), ApplyError> {
        if self.poison.contains(&event.stream) {
            return Err(ApplyError::new(event.sequence, "poisoned stream"));
        }
        self.applied.lock().unwrap().push(event.clone());
        Ok(())
    }
}

/// Polls `condition` until it returns true or the timeout passes.
pub async fn wait_until<F: FnMut() -> bool>(mut condition: F, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
