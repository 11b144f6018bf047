//! A parallel TAP test harness: loads a tree of test Cases (and Suites of
//! them) from the command line or a declarative YAML suite file, dispatches
//! them across a pool of named resources, and reports the aggregated result
//! as text and optionally JUnit XML.

pub mod case;
pub mod cli;
pub mod error;
pub mod output;
pub mod result;
pub mod scheduler;
pub mod suite;
pub mod tap;
pub mod worker;
