//! Test modules for the broker consumer
//!
//! Engine tests run against the in-memory transport and are grouped by
//! functional area.

mod support;
