//! Application module

pub mod args;
pub mod startup;
