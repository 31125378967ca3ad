pub mod health;
pub mod router;
pub mod strategy;

pub use health::{HealthReport, HealthThresholds, ReplicaDescriptor, ReplicaProbe, ReplicaState, ReplicaStatus};
pub use router::ReplicaRouter;
pub use strategy::SelectionStrategy;
