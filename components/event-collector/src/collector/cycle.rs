//! One collection cycle: acquire a cursor (retried), drain it, release it,
//! order the result.
//!
//! The cursor is closed on every path once it has been acquired, whether the
//! drain succeeded or not.

// Local crates
use crate::{
    collector::{
        filter::EventFilterSpec,
        normalizer::sort_chronologically,
        paginator::{CollectError, MAX_PAGE_SIZE, collect_events},
    },
    gateway::gateway::{EventCursor, GatewayError, SessionGateway},
    metrics::metrics::{
        CURSOR_ACQUIRE_ATTEMPTS_TOTAL, CURSOR_ACQUIRE_FAILURES_TOTAL, CYCLE_DURATION_SECONDS,
        observe_duration,
    },
    models::event::Event,
    retry::retry::{RetryPolicy, retry},
};

// External crates
use std::time::Instant;
use tracing::instrument;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionOptions {
    pub page_size: usize,
    pub max_events: Option<usize>,
}

impl Default for CollectionOptions {
    fn default() -> Self {
        Self {
            page_size: MAX_PAGE_SIZE,
            max_events: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CycleError {
    #[error("could not acquire an event cursor: {0}")]
    Acquire(#[source] GatewayError),
    #[error(transparent)]
    Collect(#[from] CollectError),
}

/// Ordered events of one window.
#[derive(Debug)]
pub struct CycleOutput {
    pub filter: EventFilterSpec,
    pub events: Vec<Event>,
}

#[instrument(
    name = "event_collector_cycle::run",
    target = "collector::cycle",
    skip_all,
    fields(begin_time = %filter.begin_time, end_time = %filter.end_time),
    level = "info"
)]
pub async fn run_cycle<G>(
    gateway: &G,
    filter: EventFilterSpec,
    options: &CollectionOptions,
    policy: &RetryPolicy,
) -> Result<CycleOutput, CycleError>
where
    G: SessionGateway,
{
    let started = Instant::now();
    let filter_ref = &filter;

    let mut cursor = retry(policy, GatewayError::is_retryable, move || {
        CURSOR_ACQUIRE_ATTEMPTS_TOTAL.inc();
        gateway.acquire_cursor(filter_ref)
    })
    .await
    .map_err(|e| {
        CURSOR_ACQUIRE_FAILURES_TOTAL.inc();
        CycleError::Acquire(e)
    })?;
    tracing::info!("Connected, event cursor acquired");

    let collected = collect_events(&mut cursor, options.page_size, options.max_events).await;

    if let Err(e) = cursor.close().await {
        tracing::warn!(error = %e, "Failed to release event cursor");
    }

    let events = sort_chronologically(collected?);
    observe_duration(&CYCLE_DURATION_SECONDS, started);

    tracing::debug!(
        event_count = events.len(),
        begin_time = %filter.begin_time,
        end_time = %filter.end_time,
        "Collection cycle finished"
    );

    Ok(CycleOutput { filter, events })
}
