pub mod manager;
pub mod prober;

pub use manager::PoolManager;
pub use prober::{Prober, ProbeTransport, DEFAULT_PROBE_TARGETS};
