//! Error types and result definitions for the fstore foreign storage subsystem.
//!
//! All fstore crates share a single error enum ([`Error`]) and result alias
//! ([`Result<T>`]). Operations that can fail return `Result<T>` and propagate
//! errors with the `?` operator; user-visible failures carry the exact message
//! the SQL layer surfaces, so the display strings here are part of the
//! external contract.
//!
//! # Error Categories
//!
//! - **Source errors** ([`Error::SourceInvalid`], [`Error::SourceShrunk`],
//!   [`Error::SourceMemberGone`]): the foreign source is malformed or mutated
//!   in a way an append refresh cannot accept.
//! - **Refresh errors** ([`Error::PostEvictionRefresh`], [`Error::BadOption`]):
//!   refresh protocol and option failures.
//! - **Write rejection** ([`Error::WriteRejected`]): foreign tables are
//!   read-only.
//! - **Carriers** ([`Error::Io`], [`Error::Parquet`], [`Error::Json`]):
//!   underlying library failures.
//! - **Internal errors** ([`Error::Internal`]): bugs or violated invariants.

pub mod error;
pub mod result;

pub use error::Error;
pub use result::Result;
