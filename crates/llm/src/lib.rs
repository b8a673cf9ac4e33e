//! CogWorks reasoning provider infrastructure adapter.
//!
//! Implements the [`pipeline::ReasoningProvider`] trait for Anthropic's
//! Messages API. Additional providers are added as new types in this crate
//! without any changes to the `pipeline` crate.
//!
//! ## Architectural Layer
//!
//! **Infrastructure.** HTTP transport, request formatting, response parsing,
//! rate-limit header handling and cost accounting live here. The
//! [`pipeline`] crate sees only [`pipeline::ReasoningProvider`]. Rate limits
//! surface as [`pipeline::ReasoningError::RateLimited`]; backing off is the
//! next trigger's job, not this crate's.
//!
//! ## Credentials
//!
//! The API key comes from `ANTHROPIC_API_KEY` only and is wrapped in
//! [`ApiKey`], which never prints its value.

pub mod anthropic;
pub mod pricing;
pub mod secret;

pub use anthropic::{AnthropicConfig, AnthropicProvider};
pub use pricing::Pricing;
pub use secret::ApiKey;
