//! Consumer integration test modules

pub mod custom_transport;
pub mod scenarios;
