//! Network side of link supervision: host discovery and reachability

pub mod neighbor;
pub mod probe;
pub mod prober;
mod subnet;

pub use probe::{NetProbe, SystemNetProbe};
pub use prober::{ConnectivityProber, Reachability};
pub use subnet::Subnet;
