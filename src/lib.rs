// Library interface for the synguard firewall components
// Allows testing and reuse of the inspection pipeline

pub mod config;
pub mod conn_table;
pub mod cookie;
pub mod flags;
pub mod monitor;
pub mod packet;
pub mod pipeline;
pub mod stats;

#[cfg(target_os = "linux")]
pub mod nfqueue;
