//! Queue workers.
//!
//! - `pool`: per-lane polling workers that claim jobs from the SQLite queue
//!   and hand them to a `JobWorker`

pub mod pool;
