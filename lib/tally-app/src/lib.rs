//! Process-level helpers for applications embedding the tally engine.
#![deny(warnings)]
#![deny(missing_docs)]

pub mod logging;
