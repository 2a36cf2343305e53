#![forbid(unsafe_code)]

//! Browser facade for `unloader-core`.
//!
//! The engine stays host-driven: JS owns the `IntersectionObserver`s, the
//! `MutationObserver`, idle callbacks and the maintenance timer. This crate
//! provides
//!
//! - [`CommandQueue`], an `ObserverHost` that turns engine requests into
//!   serializable [`HostCommand`]s for the glue to apply, and
//! - on `wasm32`, `DomAdapter` (a `web-sys` render adapter) and the exported
//!   `WebUnloader` session.
//!
//! Observer callbacks go back in as JSON `SchedulerEvent`s via
//! `WebUnloader::dispatch`; see [`decode_events`].

pub mod commands;

pub use commands::{CommandQueue, HostCommand, decode_events};

#[cfg(target_arch = "wasm32")]
mod wasm;

#[cfg(target_arch = "wasm32")]
pub use wasm::{DomAdapter, WebUnloader};
