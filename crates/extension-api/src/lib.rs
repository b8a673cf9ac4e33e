//! CogWorks Extension API client adapter.
//!
//! Implements the [`pipeline::DomainServiceClient`] trait over the Extension
//! API: a JSON request/response protocol carried on Unix domain sockets
//! (default) or HTTP.
//!
//! ## Architectural Layer
//!
//! **Infrastructure.** Framing, transport selection, timeouts and response
//! validation all live here. The [`pipeline`] crate sees only
//! [`pipeline::DomainServiceClient`].
//!
//! ## Transport
//!
//! Transport is selected per domain service registration in `.cogworks/services.toml`:
//!
//! - `transport = "unix"`: Unix domain socket (default; file-system permissions
//!   provide access control). One request line, one response line.
//! - `transport = "http"`: HTTPS POST. Plain `http://` is accepted only for
//!   loopback hosts.
//!
//! Every reply is validated against the response envelope before the engine
//! sees it; a reply that does not conform is a
//! [`pipeline::DomainServiceError::Fault`], never pipeline input.

pub mod client;
pub mod registry;
pub mod transport;

pub use client::ExtensionApiClient;
pub use registry::{Endpoint, RegistryError, ServiceEntry, ServiceRegistry};
