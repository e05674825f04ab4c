//! Turns storage and workflow notifications into versioned packages:
//! a report is fetched, split into one CSV file per table, summarized,
//! and the resulting folder is pushed to a package registry.

pub mod app;
pub mod client;
pub mod conf;
pub mod debounce;
pub mod error;
pub mod gatk;
pub mod package;
pub mod registry;
pub mod report;
pub mod sign;
pub mod storage;
pub mod store;
pub mod trigger;
