//! `herald-core`: domain payloads and identifiers shared by notification producers.
//!
//! This crate contains **pure domain** primitives (no storage or delivery concerns).

pub mod error;
pub mod id;
pub mod payload;

pub use error::{DomainError, DomainResult};
pub use id::{SignupId, TaskId, UserId};
pub use payload::{NewUser, TaskSignup, TransactionalEmailRequest, UserLogin};
