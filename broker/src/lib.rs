//! A durable, prioritized request broker: claims queued requests from SQL
//! Server, pushes them through the rate-limited ETRAN SOAP gateway, and
//! writes the decoded replies back.
//!
//! Data flow:
//!
//! ```text
//! DB -> producer -> queue_in (priority) -> workers -> queue_out (FIFO) -> consumer -> DB
//! ```
//!
//! with two back-edges: the consumer republishes a request to `queue_in` when
//! the upstream is down or rate-limiting, and a worker republishes its own
//! request on a network failure.

/// Command line interface.
pub mod cli;
/// Service configuration loaded from `config.yaml`.
pub mod config;
/// DB consumer loop: persists decoded responses.
pub mod consumer;
/// SQL Server session layer around the three stored procedures.
pub mod db;
/// The upstream SOAP protocol: request builders and the response decoder.
pub mod etran;
/// Liveness file for the external watchdog.
pub mod heartbeat;
/// The packets circulating between the loops.
pub mod packet;
/// DB producer loop: claims rows and builds request bodies.
pub mod producer;
/// Bounded priority queue backing `queue_in`.
pub mod queue;
/// Orchestration: spawns the pipeline and joins it on shutdown.
pub mod run;
/// Loopback control endpoint (`/wakeup`).
pub mod server;
/// Upstream status flag shared between workers and the consumer.
pub mod state;
/// Worker pool: POSTs request bodies to the upstream.
pub mod worker;
