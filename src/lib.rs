//! Tracks how much time goes into each of your projects. A screenshot is taken at adaptive
//! intervals, classified against the projects you described and the time is credited to the
//! best match.

pub mod capture;
pub mod classify;
pub mod cli;
pub mod tracker;
pub mod utils;
