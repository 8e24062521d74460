pub mod broker;
pub mod core;

include!(concat!(env!("OUT_DIR"), "/version.rs"));
