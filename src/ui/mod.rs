//! Terminal rendering for fix-run progress.

mod progress;

pub use progress::FixUi;
