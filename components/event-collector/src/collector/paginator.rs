// Local crates
use crate::{
    gateway::gateway::{EventCursor, GatewayError},
    metrics::metrics::{EVENTS_READ_TOTAL, PAGES_READ_TOTAL},
    models::event::Event,
};

// External crates
use tracing::instrument;

/// Largest page `ReadNextEvents` will return.
pub const MAX_PAGE_SIZE: usize = 1000;

#[derive(Debug, thiserror::Error)]
pub enum CollectError {
    #[error("page size must be within 1..={MAX_PAGE_SIZE}, got {0}")]
    InvalidPageSize(usize),
    #[error("failed to read page {page}: {source}")]
    Page {
        page: usize,
        #[source]
        source: GatewayError,
    },
    #[error("collected {collected} events, more than the configured limit of {limit}")]
    LimitExceeded { collected: usize, limit: usize },
}

/// Drain `cursor` page by page until it returns an empty page.
///
/// All-or-nothing: a failing page discards everything read so far. Events are
/// returned in page order, which is not chronological.
#[instrument(
    name = "event_collector_paginator::collect",
    target = "collector::paginator",
    skip(cursor),
    level = "debug"
)]
pub async fn collect_events<C>(
    cursor: &mut C,
    page_size: usize,
    max_events: Option<usize>,
) -> Result<Vec<Event>, CollectError>
where
    C: EventCursor + ?Sized,
{
    if page_size == 0 || page_size > MAX_PAGE_SIZE {
        return Err(CollectError::InvalidPageSize(page_size));
    }

    let mut events = Vec::new();
    let mut pages = 0usize;

    loop {
        pages += 1;
        let page = cursor
            .read_next(page_size)
            .await
            .map_err(|source| CollectError::Page { page: pages, source })?;

        if page.is_empty() {
            tracing::debug!(pages_read = pages, total = events.len(), "Cursor exhausted");
            break;
        }

        PAGES_READ_TOTAL.inc();
        EVENTS_READ_TOTAL.inc_by(page.len() as f64);
        tracing::debug!(page = pages, page_len = page.len(), "Read page of events");
        events.extend(page);

        if let Some(limit) = max_events {
            if events.len() > limit {
                tracing::error!(
                    collected = events.len(),
                    limit,
                    "Event count exceeded per-cycle limit, discarding cycle"
                );
                return Err(CollectError::LimitExceeded {
                    collected: events.len(),
                    limit,
                });
            }
        }
    }

    Ok(events)
}
