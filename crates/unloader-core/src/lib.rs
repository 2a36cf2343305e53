#![forbid(unsafe_code)]

//! `unloader-core` keeps very long chat transcripts responsive by collapsing
//! entries that scroll far outside the viewport and restoring them when they
//! come back into range.
//!
//! Design goals:
//! - **Host-driven**: the embedding environment owns the document and the
//!   visibility observers. It reports visibility changes, inserted nodes, idle
//!   slots and timer ticks as [`SchedulerEvent`] values.
//! - **No DOM coupling**: every render-tree read and write goes through
//!   [`RenderAdapter`], so the algorithm runs against [`memory::MemoryDocument`]
//!   in tests and against `web-sys` in the browser.
//! - **Single-threaded**: all state lives in one [`VisibilityScheduler`]
//!   instance. Porting to a multi-threaded runtime means putting that instance
//!   behind a single owner.
//!
//! # Layering
//!
//! | Module | Role |
//! |--------|------|
//! | [`registry`] | per-entry [`EntryState`] bookkeeping |
//! | [`codec`] | sanitize, compress, estimate memory footprint |
//! | [`virtualizer`] | collapse / restore one entry |
//! | [`scheduler`] | observer state machine and chunked ingestion |
//! | [`stats`] | counters, bounded memory history, conversation stats |

pub mod adapter;
pub mod codec;
pub mod config;
pub mod entry;
pub mod error;
pub mod memory;
pub mod registry;
pub mod scheduler;
pub mod settings;
pub mod stats;
pub mod virtualizer;

pub use adapter::{
    NodeId, ObserverHost, ObserverKind, PLACEHOLDER_ATTR, RenderAdapter, RenderError,
    ViewportMargin,
};
pub use codec::{Codec, StoredContent};
pub use config::{CodecConfig, CollapseStrategy, ConfigError, UnloaderConfig};
pub use entry::{Detachment, EntryState, Role};
pub use error::UnloaderError;
pub use registry::{EntryRegistry, TrackOutcome};
pub use scheduler::{
    Generation, IngestProgress, OptimizeReport, SchedulerEvent, SetupOutcome, VisibilityScheduler,
};
pub use settings::{BufferSize, Settings, SettingsChange, SettingsError};
pub use stats::{
    Clock, ConversationStats, ExtractedEntry, ManualClock, MemoryDataPoint, MemoryHistory,
    MemoryLedger, Stats, SystemClock,
};
pub use virtualizer::{CollapseOutcome, RestoreAllReport, RestoreOutcome, SkipReason, Virtualizer};
