//! Domain layer for the user CQRS system.
//!
//! This crate provides the write-side vocabulary:
//! - [`UserEvent`], the typed view of a committed event's payload
//! - [`CommandIngestor`], which validates commands and appends events
//! - [`MissingFieldPolicy`] for commands that omit their aggregate or type

pub mod error;
pub mod ingest;
pub mod user;

pub use error::DomainError;
pub use ingest::{CommandIngestor, IngestAck, MissingFieldPolicy, SubmitCommand};
pub use user::{
    DEFAULT_EMAIL, DEFAULT_NAME, USER_BALANCE, USER_CREATED, UserBalanceData, UserCreatedData,
    UserEvent,
};
