//! Library half of the `wgpool` binary

pub mod config;
pub mod report;
