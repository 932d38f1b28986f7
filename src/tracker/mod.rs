//! The tracking engine. [scheduler::ScanScheduler] decides when scans happen,
//! [session::Tracker] runs them and merges their results into the
//! [storage::collection::ProjectCollection].

pub mod commands;
pub mod interval;
pub mod rate_limit;
pub mod review;
pub mod scheduler;
pub mod session;
pub mod shutdown;
pub mod storage;
