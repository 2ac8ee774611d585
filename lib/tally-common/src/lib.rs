//! Common building blocks shared across the workspace.
#![deny(warnings)]
#![deny(missing_docs)]

pub mod cache;
pub mod collections;
pub mod hash;
pub mod task;
