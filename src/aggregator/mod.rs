/// Shared buffer of matched kernel lines
pub mod journal_buffer;

/// Periodic, debounced flushing of the journal buffer
pub mod report_scheduler;

pub use journal_buffer::JournalBuffer;
pub use report_scheduler::{ReportScheduler, JOURNAL_GUIDANCE, JOURNAL_REPORT_SUBJECT};
