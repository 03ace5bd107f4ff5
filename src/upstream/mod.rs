pub mod health;
pub mod node;
pub mod registry;

pub use node::{ActiveGuard, NodeSnapshot, ProxyNode, CIRCUIT_BREAKER_THRESHOLD};
pub use registry::UpstreamRegistry;
