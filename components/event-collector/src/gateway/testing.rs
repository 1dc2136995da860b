//! Scripted gateway and cursor used by pipeline tests.

// Local crates
use crate::{
    collector::filter::EventFilterSpec,
    gateway::gateway::{EventCursor, GatewayError, SessionGateway},
    models::event::Event,
};

// External crates
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// What a scripted cursor answers to successive `read_next` calls.
#[derive(Debug, Clone)]
pub enum Page {
    Events(Vec<Event>),
    Fail(GatewayError),
}

/// Observations shared between a scripted gateway, its cursors and the test.
#[derive(Debug, Default)]
pub struct Ledger {
    pub acquire_attempts: usize,
    pub filters: Vec<EventFilterSpec>,
    pub page_requests: Vec<usize>,
    pub closes: usize,
}

#[derive(Debug)]
pub struct ScriptedCursor {
    pages: VecDeque<Page>,
    ledger: Arc<Mutex<Ledger>>,
}

impl ScriptedCursor {
    pub fn new(pages: Vec<Page>) -> Self {
        Self {
            pages: pages.into(),
            ledger: Arc::default(),
        }
    }

    pub fn ledger(&self) -> Arc<Mutex<Ledger>> {
        Arc::clone(&self.ledger)
    }
}

#[async_trait]
impl EventCursor for ScriptedCursor {
    async fn read_next(&mut self, max_count: usize) -> Result<Vec<Event>, GatewayError> {
        self.ledger.lock().unwrap().page_requests.push(max_count);
        match self.pages.pop_front() {
            Some(Page::Events(events)) => Ok(events),
            Some(Page::Fail(e)) => Err(e),
            None => Ok(Vec::new()),
        }
    }

    async fn close(&mut self) -> Result<(), GatewayError> {
        self.ledger.lock().unwrap().closes += 1;
        Ok(())
    }
}

/// Gateway that fails the first acquisitions with scripted errors, then hands
/// out cursors replaying `pages`.
#[derive(Debug)]
pub struct ScriptedGateway {
    acquire_failures: Mutex<VecDeque<GatewayError>>,
    pages: Vec<Page>,
    ledger: Arc<Mutex<Ledger>>,
}

impl ScriptedGateway {
    pub fn new(pages: Vec<Page>) -> Self {
        Self {
            acquire_failures: Mutex::default(),
            pages,
            ledger: Arc::default(),
        }
    }

    pub fn failing_first(mut self, failures: Vec<GatewayError>) -> Self {
        self.acquire_failures = Mutex::new(failures.into());
        self
    }

    pub fn ledger(&self) -> Arc<Mutex<Ledger>> {
        Arc::clone(&self.ledger)
    }
}

#[async_trait]
impl SessionGateway for ScriptedGateway {
    type Cursor = ScriptedCursor;

    async fn acquire_cursor(&self, filter: &EventFilterSpec) -> Result<ScriptedCursor, GatewayError> {
        {
            let mut ledger = self.ledger.lock().unwrap();
            ledger.acquire_attempts += 1;
            ledger.filters.push(filter.clone());
        }
        if let Some(e) = self.acquire_failures.lock().unwrap().pop_front() {
            return Err(e);
        }
        Ok(ScriptedCursor {
            pages: self.pages.clone().into(),
            ledger: Arc::clone(&self.ledger),
        })
    }
}
