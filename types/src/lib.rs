//! Core domain types for crossframe.
//!
//! This crate contains pure domain types with no IO, no async, and minimal dependencies.
//! Everything here can be used from any layer: the host page, the relay document and
//! the authorization-result window all speak in these types.

// Pedantic lint configuration - these are intentional design choices
#![allow(clippy::missing_errors_doc)] // Result-returning functions are self-explanatory
#![allow(clippy::missing_panics_doc)] // Panics are documented in assertions

mod catalog;
mod envelope;
mod failure;
mod ids;
mod query;
mod transport;

pub use catalog::{ApiCatalog, ApiDescriptor, ParamDescriptor};
pub use envelope::{
    ApiReply, ApiRequest, CallEnvelope, EnvelopeError, HttpMethod, ResponseBody, ResponseEnvelope,
    ResponseFormat,
};
pub use failure::{EMPTY_INTERFACE, Failure, FailureKind};
pub use ids::{ChannelId, CorrelationId};
pub use query::{decode_query, encode_query};
pub use transport::{Capabilities, ReadyState, TransportKind, UnknownSolution};

/// The literal the relay document posts to its parent once it has loaded.
pub const HANDSHAKE_SIGNAL: &str = "success";
