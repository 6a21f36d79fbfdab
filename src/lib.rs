//! # medialoom
//!
//! Modular multimedia pipeline framework: processing stages ("pipes") are
//! composed into graphs carrying timestamped payload buffers, with
//! cooperative single-threaded scheduling and explicit, queue-based
//! crossings between threads.
//!
//! # Architecture
//!
//! ```text
//! source ──packets──> pipe ──packets──> ... ──packets──> sink
//!    │                  │                                  │
//!    └──── events ──────┴───────── probe chains ───────────┘
//!
//! control (flow defs, outputs, requests) flows down;
//! events (logs, needs, clock refs) bubble up.
//! ```
//!
//! The layers, bottom up:
//!
//! - [`mem`] — backing allocators for large contiguous regions
//! - [`attr`] — densely encoded attribute dictionaries
//! - [`buf`] — zero-copy block / picture / sound payloads
//! - [`packet`] — the unit of flow: payload + attributes + clocks
//! - [`flow`] — flow-definition helpers
//! - [`probe`] — upward event chains and their decorators
//! - [`evloop`] / [`sync`] — the cooperative reactor and cross-loop queues
//! - [`pipe`] — the pipe contract: input, control, outputs, requests
//! - [`xfer`] — moving a pipe to another loop's thread
//! - [`ts`] — MPEG-TS encapsulation, aggregation and muxing
//! - [`rtp`] — RTP decapsulation
//!
//! # Data Flow
//!
//! A packet pushed into a pipe is consumed: the pipe forwards it, holds it
//! or frees it. Payload storage is shared by reference and copy-on-write;
//! writable access to shared storage fails with
//! [`Error::Busy`](error::Error::Busy).

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod attr;
pub mod buf;
pub mod clock;
pub mod error;
pub mod evloop;
pub mod flow;
pub mod mem;
pub mod packet;
pub mod pipe;
pub mod probe;
pub mod rtp;
pub mod sync;
pub mod ts;
pub mod xfer;

pub use error::{Error, Result};
