//! CogWorks GitHub infrastructure adapter.
//!
//! Implements [`pipeline::ArtifactStore`] over the GitHub REST API: work
//! items are issues, run records are comments written by the engine's own
//! account, sub-work-items are sub-issues.
//!
//! ## Architectural Layer
//!
//! **Infrastructure.** This crate must not contain domain rules.
//! All GitHub API details (rate limiting, pagination, authentication, body
//! markers) are handled here; the [`pipeline`] crate never sees them.
//!
//! ## Credentials
//!
//! The token is read from `GITHUB_TOKEN` and held in [`GithubToken`], which
//! never prints its value.

pub mod client;
pub mod markers;
pub mod store;
pub mod token;

pub use client::{GithubClient, DEFAULT_API_URL};
pub use store::GithubArtifactStore;
pub use token::GithubToken;
