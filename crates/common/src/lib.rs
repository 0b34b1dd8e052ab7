//! Shared types for the user CQRS system.

pub mod types;

pub use types::AggregateId;
