//! Work dispatch: broker lanes, worker pool, beat and task handlers.

pub mod alerts;
pub mod beat;
pub mod housekeeping;
pub mod queue;
pub mod scrape;
pub mod worker;
