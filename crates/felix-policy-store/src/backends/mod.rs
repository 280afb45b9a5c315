//! Concrete [`RuleGateway`](crate::gateway::RuleGateway) implementations.
pub mod memory;
pub mod mongo;
pub mod postgres;
