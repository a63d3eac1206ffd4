//! The upstream SOAP protocol: request builders and the response decoder.

/// Request-body builders, one per request type.
pub mod request;
/// Decoder for the upstream's nested response envelopes.
pub mod response;
/// Minimal XML element tree used by the codecs.
pub(crate) mod xml;
