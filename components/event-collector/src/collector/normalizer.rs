// Local crates
use crate::models::event::Event;

/// Order events by creation time, oldest first.
///
/// `ReadNextEvents` pages are not chronological. The sort is stable so events
/// sharing a timestamp keep their page order.
pub fn sort_chronologically(mut events: Vec<Event>) -> Vec<Event> {
    events.sort_by_key(|event| event.created_time);
    events
}
