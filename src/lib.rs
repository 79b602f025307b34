//! telem-core: the core of a client-side telemetry SDK.
//!
//! Applications submit structured [`event::Event`]s; a [`pipeline::Pipeline`]
//! applies policy and serializes them; the [`store::OfflineStore`] buffers
//! them durably; a [`transport::Transmitter`] drains the store to a
//! collector endpoint with backoff and retry; accepted payloads fan out to
//! registered [`viewer::Viewer`]s. [`context::Logger`] wires all four
//! together behind one handle.
//!
//! # Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use telem_core::config::ConfigBuilder;
//! use telem_core::context::initialize_logger;
//! use telem_core::event::{Event, Priority};
//! use telem_core::pipeline::serializer::CompactSerializer;
//!
//! # struct RealHttpTransport;
//! # #[async_trait::async_trait]
//! # impl telem_core::transport::HttpTransport for RealHttpTransport {
//! #     async fn send(&self, _req: telem_core::transport::Request)
//! #         -> Result<telem_core::transport::Response, telem_core::transport::TransmitOutcome> {
//! #         unimplemented!()
//! #     }
//! # }
//! # async fn run() -> telem_core::error::TelemetryResult<()> {
//! let config = ConfigBuilder::new()
//!     .event_collector_uri("https://collector.example.com/v1")
//!     .primary_token("my-tenant")
//!     .build()?;
//!
//! let logger = initialize_logger(config, Arc::new(RealHttpTransport), Arc::new(CompactSerializer))?;
//! let event = Event::new("App.Started", "my-tenant", Priority::Normal, chrono::Utc::now())
//!     .expect("valid event name and tenant");
//! logger.log_event(event);
//! # Ok(())
//! # }
//! ```

pub mod clock_skew;
pub mod config;
pub mod context;
pub mod error;
pub mod event;
pub mod pipeline;
pub mod stats;
pub mod store;
pub mod transport;
pub mod viewer;

pub use config::{Config, ConfigBuilder};
pub use context::{initialize, initialize_logger, Logger};
pub use error::{TelemetryError, TelemetryResult};
pub use event::Event;
