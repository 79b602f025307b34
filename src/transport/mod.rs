//! Transmission Controller
//!
//! Everything involved in getting a serialized, packaged payload from the
//! offline store to the collector endpoint: backoff bookkeeping
//! ([`backoff`]), the HTTP boundary ([`http`]), and the dispatch state
//! machine that ties them together ([`transmitter`]).

pub mod backoff;
pub mod http;
pub mod transmitter;

pub use http::{HttpTransport, Request, Response, TransmitOutcome};
pub use transmitter::{DispatchResult, EndpointState, Transmitter};
