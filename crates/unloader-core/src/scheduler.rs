#![forbid(unsafe_code)]

//! Visibility scheduler: the per-entry state machine and ingestion pipeline.
//!
//! The host owns the real observers, the mutation watcher, idle callbacks and
//! the maintenance timer. It reports what they see as [`SchedulerEvent`]s and
//! the scheduler answers by driving the [`Virtualizer`] and issuing
//! [`ObserverHost`] commands.
//!
//! # State machine
//!
//! ```text
//!            EntryHidden (enabled)
//!   Active ─────────────────────────▶ Collapsed
//!     ▲                                  │
//!     │   PlaceholderVisible (detach)    │
//!     └──────────────────────────────────┘
//!         EntryVisible (in place)
//!         disable → restore_all
//! ```
//!
//! # Generations
//!
//! Every observer rebuild bumps the [`Generation`]. Observer and idle events
//! carry the generation they were issued under; events from an older
//! generation are dropped, so a torn-down observer can never drive a
//! transition and an idle slot requested before a rebuild is re-requested
//! under the new generation instead.
//!
//! # Batches
//!
//! [`VisibilityScheduler::dispatch_batch`] processes events in delivery order
//! and notifies the stats hook at most once, and only if the
//! `(total, active, collapsed)` counts moved.

use std::collections::VecDeque;
use std::fmt;

use ahash::AHashSet;
use serde::{Deserialize, Serialize};

use crate::adapter::{NodeId, ObserverHost, ObserverKind, RenderAdapter, ViewportMargin};
use crate::config::{CollapseStrategy, UnloaderConfig};
use crate::entry::Role;
use crate::error::UnloaderError;
use crate::registry::TrackOutcome;
use crate::settings::{Settings, SettingsChange};
use crate::stats::{Clock, ConversationStats, ExtractedEntry, MemoryDataPoint, Stats, SystemClock};
use crate::virtualizer::{CollapseOutcome, RestoreOutcome, Virtualizer};

/// Observer generation. Bumped on every observer rebuild.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Generation(pub u64);

impl Generation {
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "g{}", self.0)
    }
}

/// Everything the host reports back to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SchedulerEvent {
    /// The primary observer saw an entry enter the viewport window.
    EntryVisible { generation: Generation, node: NodeId },
    /// The primary observer saw an entry leave the viewport window.
    EntryHidden { generation: Generation, node: NodeId },
    /// The placeholder observer saw a placeholder enter the viewport window.
    PlaceholderVisible {
        generation: Generation,
        placeholder: NodeId,
    },
    /// The mutation watcher saw these roots inserted under the container.
    NodesInserted { nodes: Vec<NodeId> },
    /// An idle slot requested via [`ObserverHost::request_idle`] arrived.
    Idle { generation: Generation },
    /// Maintenance timer fired.
    Tick,
}

/// Ingestion progress, reported at chunk boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestProgress {
    pub processed: usize,
    pub total: usize,
    pub complete: bool,
}

/// Result of [`VisibilityScheduler::force_optimize`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimizeReport {
    pub collapsed: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum SetupOutcome {
    Started { container: NodeId, queued: usize },
    /// No container matched; the host may call `start` again later.
    ContainerNotFound,
    AlreadyStarted,
}

type ProgressHook = Box<dyn FnMut(IngestProgress)>;
type StatsHook = Box<dyn FnMut(&Stats)>;

/// Owns one virtualization session over a document.
pub struct VisibilityScheduler<A, H> {
    dom: A,
    host: H,
    config: UnloaderConfig,
    settings: Settings,
    virtualizer: Virtualizer,
    generation: Generation,
    container: Option<NodeId>,
    pending: VecDeque<NodeId>,
    queued: AHashSet<NodeId>,
    ingest_processed: usize,
    ingest_total: usize,
    idle_requested: bool,
    maintenance_running: bool,
    /// Entries last reported inside the viewport window.
    visible: AHashSet<NodeId>,
    on_progress: Option<ProgressHook>,
    on_stats_change: Option<StatsHook>,
}

impl<A: fmt::Debug, H: fmt::Debug> fmt::Debug for VisibilityScheduler<A, H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VisibilityScheduler")
            .field("dom", &self.dom)
            .field("host", &self.host)
            .field("settings", &self.settings)
            .field("generation", &self.generation)
            .field("container", &self.container)
            .field("pending", &self.pending.len())
            .field("tracked", &self.virtualizer.registry().len())
            .finish_non_exhaustive()
    }
}

impl<A, H> VisibilityScheduler<A, H>
where
    A: RenderAdapter,
    H: ObserverHost,
{
    pub fn new(dom: A, host: H, config: UnloaderConfig, settings: Settings) -> Self {
        Self::with_clock(dom, host, config, settings, Box::new(SystemClock))
    }

    pub fn with_clock(
        dom: A,
        host: H,
        config: UnloaderConfig,
        settings: Settings,
        clock: Box<dyn Clock>,
    ) -> Self {
        let virtualizer = Virtualizer::with_clock(&config, clock);
        Self {
            dom,
            host,
            config,
            settings,
            virtualizer,
            generation: Generation::default(),
            container: None,
            pending: VecDeque::new(),
            queued: AHashSet::new(),
            ingest_processed: 0,
            ingest_total: 0,
            idle_requested: false,
            maintenance_running: false,
            visible: AHashSet::new(),
            on_progress: None,
            on_stats_change: None,
        }
    }

    /// Called at every chunk boundary and at completion.
    pub fn on_progress(&mut self, hook: impl FnMut(IngestProgress) + 'static) {
        self.on_progress = Some(Box::new(hook));
    }

    /// Called after any batch that changed the total/active/collapsed counts.
    pub fn on_stats_change(&mut self, hook: impl FnMut(&Stats) + 'static) {
        self.on_stats_change = Some(Box::new(hook));
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn dom(&self) -> &A {
        &self.dom
    }

    pub fn dom_mut(&mut self) -> &mut A {
        &mut self.dom
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }

    pub fn virtualizer(&self) -> &Virtualizer {
        &self.virtualizer
    }

    pub fn config(&self) -> &UnloaderConfig {
        &self.config
    }

    pub const fn settings(&self) -> Settings {
        self.settings
    }

    pub const fn generation(&self) -> Generation {
        self.generation
    }

    pub const fn container(&self) -> Option<NodeId> {
        self.container
    }

    /// Entries discovered but not yet ingested.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn margin(&self) -> ViewportMargin {
        self.settings
            .buffer_size
            .margin(self.config.margin_per_buffer_px)
    }

    pub fn stats(&self) -> Stats {
        self.virtualizer.stats(&self.dom)
    }

    pub fn history(&self) -> Vec<MemoryDataPoint> {
        self.virtualizer.history()
    }

    pub fn extract_content(&self, node: NodeId) -> String {
        self.virtualizer.extract_content(&self.dom, node)
    }

    pub fn extract_all(&self) -> Vec<ExtractedEntry> {
        self.virtualizer.extract_all(&self.dom)
    }

    pub fn conversation_stats(&self) -> ConversationStats {
        ConversationStats::from_entries(&self.extract_all())
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Locate the container, start watching it and queue its existing entries.
    pub fn start(&mut self) -> SetupOutcome {
        if self.container.is_some() {
            return SetupOutcome::AlreadyStarted;
        }
        let Some(container) = self.dom.find_container() else {
            tracing::debug!(target: "unloader.scheduler", "no transcript container yet");
            return SetupOutcome::ContainerNotFound;
        };
        self.container = Some(container);
        self.host.watch_mutations(container);
        self.rebuild_observers();
        if self.settings.enabled {
            self.start_maintenance();
        }
        let queued = self.enqueue(self.dom.entries_within(container));
        self.request_idle();
        tracing::debug!(target: "unloader.scheduler", %container, queued, "scheduler started");
        SetupOutcome::Started { container, queued }
    }

    /// Restore everything and tear down all host resources.
    pub fn dispose(mut self) -> (A, H) {
        self.stop();
        self.virtualizer.clear();
        self.release_detached();
        (self.dom, self.host)
    }

    /// Restore everything, forget the conversation and scan again.
    ///
    /// Used when the host navigates to another conversation in the same page.
    pub fn reset_conversation(&mut self) -> SetupOutcome {
        let before = self.virtualizer.counts();
        self.stop();
        self.virtualizer.clear();
        self.release_detached();
        let outcome = self.start();
        self.notify_if_changed(before);
        outcome
    }

    fn stop(&mut self) {
        self.generation = self.generation.next();
        self.host.disconnect(ObserverKind::Primary);
        self.host.disconnect(ObserverKind::Placeholder);
        if self.container.take().is_some() {
            self.host.stop_watching_mutations();
        }
        self.stop_maintenance();
        let report = self.virtualizer.restore_all(&mut self.dom);
        if report.abandoned > 0 {
            tracing::warn!(target: "unloader.scheduler", abandoned = report.abandoned, "entries lost during teardown");
        }
        self.pending.clear();
        self.queued.clear();
        self.visible.clear();
        self.ingest_processed = 0;
        self.ingest_total = 0;
        self.idle_requested = false;
    }

    // -----------------------------------------------------------------------
    // Settings
    // -----------------------------------------------------------------------

    /// Apply a settings update from the host's settings channel.
    pub fn apply_settings(&mut self, next: Settings) -> SettingsChange {
        let change = self.settings.diff(&next);
        if change.is_empty() {
            return change;
        }
        let before = self.virtualizer.counts();
        self.settings = next;
        match change.enabled {
            Some(true) => self.enable(),
            Some(false) => self.disable(),
            None => {
                if self.container.is_some() {
                    self.rebuild_observers();
                }
            }
        }
        tracing::debug!(
            target: "unloader.scheduler",
            enabled = next.enabled,
            buffer_size = next.buffer_size.get(),
            generation = %self.generation,
            "settings applied"
        );
        self.notify_if_changed(before);
        change
    }

    pub fn set_enabled(&mut self, enabled: bool) -> SettingsChange {
        self.apply_settings(Settings {
            enabled,
            ..self.settings
        })
    }

    fn enable(&mut self) {
        if self.container.is_none() {
            return;
        }
        self.rebuild_observers();
        self.start_maintenance();
    }

    fn disable(&mut self) {
        self.generation = self.generation.next();
        self.host.disconnect(ObserverKind::Primary);
        self.host.disconnect(ObserverKind::Placeholder);
        self.stop_maintenance();
        let report = self.virtualizer.restore_all(&mut self.dom);
        self.virtualizer.prune_orphans();
        self.virtualizer.reset_stats();
        self.visible.clear();
        // The slot queued under the old generation will be dropped as stale.
        self.idle_requested = false;
        if self.container.is_some() {
            self.request_idle();
        }
        tracing::debug!(
            target: "unloader.scheduler",
            restored = report.restored,
            abandoned = report.abandoned,
            "virtualization disabled"
        );
    }

    /// Recreate both observers under a new generation and re-attach every
    /// tracked entry to the observer matching its state.
    fn rebuild_observers(&mut self) {
        self.generation = self.generation.next();
        self.host.disconnect(ObserverKind::Primary);
        self.host.disconnect(ObserverKind::Placeholder);
        if self.settings.enabled {
            let margin = self.margin();
            self.host.connect(ObserverKind::Primary, self.generation, margin);
            self.host.connect(ObserverKind::Placeholder, self.generation, margin);
            let strategy = self.virtualizer.strategy();
            for (node, state) in self.virtualizer.registry().iter() {
                match (state.is_collapsed, strategy, state.placeholder) {
                    (true, CollapseStrategy::Detach, Some(placeholder)) => {
                        if self.dom.is_connected(placeholder) {
                            self.host.observe(ObserverKind::Placeholder, placeholder);
                        }
                    }
                    (true, CollapseStrategy::Detach, None) => {}
                    _ => {
                        if self.dom.is_connected(node) {
                            self.host.observe(ObserverKind::Primary, node);
                        }
                    }
                }
            }
        }
        self.idle_requested = false;
        self.request_idle();
    }

    fn start_maintenance(&mut self) {
        if !self.maintenance_running {
            self.host
                .start_maintenance(self.config.maintenance_interval());
            self.maintenance_running = true;
        }
    }

    fn stop_maintenance(&mut self) {
        if self.maintenance_running {
            self.host.cancel_maintenance();
            self.maintenance_running = false;
        }
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    pub fn dispatch(&mut self, event: SchedulerEvent) {
        self.dispatch_batch([event]);
    }

    /// Process host events in delivery order, then notify the stats hook
    /// once if the counts changed.
    pub fn dispatch_batch<I>(&mut self, events: I)
    where
        I: IntoIterator<Item = SchedulerEvent>,
    {
        let _span = tracing::debug_span!(target: "unloader.scheduler", "dispatch_batch").entered();
        let before = self.virtualizer.counts();
        for event in events {
            self.handle(event);
        }
        self.notify_if_changed(before);
    }

    fn handle(&mut self, event: SchedulerEvent) {
        match event {
            SchedulerEvent::EntryVisible { generation, node } => {
                if self.is_live(generation) {
                    self.visible.insert(node);
                    let collapsed = self
                        .virtualizer
                        .registry()
                        .get(node)
                        .is_some_and(|s| s.is_collapsed);
                    if collapsed {
                        let _ = self.restore_entry(node);
                    }
                }
            }
            SchedulerEvent::EntryHidden { generation, node } => {
                if self.is_live(generation) && self.virtualizer.registry().is_tracked(node) {
                    self.visible.remove(&node);
                    let _ = self.collapse_entry(node);
                }
            }
            SchedulerEvent::PlaceholderVisible {
                generation,
                placeholder,
            } => {
                if !self.is_live(generation) {
                    return;
                }
                match self.virtualizer.entry_for_placeholder(placeholder) {
                    Some(node) => {
                        let _ = self.restore_entry(node);
                    }
                    None => self.host.unobserve(ObserverKind::Placeholder, placeholder),
                }
            }
            SchedulerEvent::NodesInserted { nodes } => {
                if self.container.is_none() {
                    return;
                }
                let found: Vec<NodeId> = nodes
                    .into_iter()
                    .flat_map(|root| self.dom.entries_within(root))
                    .collect();
                let queued = self.enqueue(found);
                if queued > 0 {
                    tracing::debug!(target: "unloader.scheduler", queued, "entries discovered");
                    self.request_idle();
                }
            }
            SchedulerEvent::Idle { generation } => {
                if generation != self.generation {
                    tracing::debug!(target: "unloader.scheduler", %generation, current = %self.generation, "stale idle slot dropped");
                    return;
                }
                self.idle_requested = false;
                self.ingest_chunk();
            }
            SchedulerEvent::Tick => self.maintain(),
        }
    }

    /// Observer events only count when enabled and from the live generation.
    fn is_live(&self, generation: Generation) -> bool {
        if generation != self.generation {
            tracing::debug!(target: "unloader.scheduler", %generation, current = %self.generation, "stale observer event dropped");
            return false;
        }
        self.settings.enabled
    }

    fn collapse_entry(&mut self, node: NodeId) -> CollapseOutcome {
        let outcome = self.virtualizer.collapse(&mut self.dom, node);
        if let CollapseOutcome::Collapsed { placeholder, .. } = outcome {
            self.visible.remove(&node);
            if self.virtualizer.strategy() == CollapseStrategy::Detach {
                self.host.unobserve(ObserverKind::Primary, node);
                self.host.observe(ObserverKind::Placeholder, placeholder);
            }
        }
        outcome
    }

    fn restore_entry(&mut self, node: NodeId) -> RestoreOutcome {
        let outcome = self.virtualizer.restore(&mut self.dom, node);
        match outcome {
            RestoreOutcome::Restored { placeholder } => {
                self.visible.insert(node);
                if self.virtualizer.strategy() == CollapseStrategy::Detach {
                    if let Some(placeholder) = placeholder {
                        self.host.unobserve(ObserverKind::Placeholder, placeholder);
                    }
                    self.host.observe(ObserverKind::Primary, node);
                }
            }
            RestoreOutcome::Abandoned { placeholder } => {
                if let Some(placeholder) = placeholder {
                    self.host.unobserve(ObserverKind::Placeholder, placeholder);
                }
            }
            RestoreOutcome::NotCollapsed | RestoreOutcome::Untracked => {}
        }
        outcome
    }

    fn notify_if_changed(&mut self, before: (usize, usize, usize)) {
        if self.virtualizer.counts() == before {
            return;
        }
        if self.on_stats_change.is_some() {
            let stats = self.virtualizer.stats(&self.dom);
            if let Some(hook) = self.on_stats_change.as_mut() {
                hook(&stats);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Ingestion
    // -----------------------------------------------------------------------

    fn enqueue(&mut self, nodes: Vec<NodeId>) -> usize {
        let mut queued = 0;
        for node in nodes {
            if self.virtualizer.registry().is_tracked(node) || !self.queued.insert(node) {
                continue;
            }
            self.pending.push_back(node);
            queued += 1;
        }
        self.ingest_total += queued;
        queued
    }

    fn request_idle(&mut self) {
        if !self.pending.is_empty() && !self.idle_requested {
            self.host.request_idle(self.generation);
            self.idle_requested = true;
        }
    }

    fn ingest_chunk(&mut self) {
        let take = self.config.chunk_size.max(1).min(self.pending.len());
        if take == 0 {
            return;
        }
        let observing = self.settings.enabled;
        let chunk: Vec<NodeId> = self.pending.drain(..take).collect();
        for node in chunk {
            self.queued.remove(&node);
            if !self.dom.is_connected(node) {
                continue;
            }
            let role = Role::from_attr(
                self.dom
                    .attribute(node, &self.config.role_attribute)
                    .as_deref(),
            );
            if self.virtualizer.registry_mut().track(node, role) == TrackOutcome::Tracked
                && observing
            {
                self.host.observe(ObserverKind::Primary, node);
            }
        }
        self.ingest_processed += take;
        let complete = self.pending.is_empty();
        let progress = IngestProgress {
            processed: self.ingest_processed,
            total: self.ingest_total,
            complete,
        };
        tracing::debug!(
            target: "unloader.scheduler",
            processed = progress.processed,
            total = progress.total,
            complete,
            "ingested chunk"
        );
        if let Some(hook) = self.on_progress.as_mut() {
            hook(progress);
        }
        if complete {
            self.ingest_processed = 0;
            self.ingest_total = 0;
        } else {
            self.request_idle();
        }
    }

    // -----------------------------------------------------------------------
    // Maintenance and user actions
    // -----------------------------------------------------------------------

    fn maintain(&mut self) {
        if !self.settings.enabled {
            return;
        }
        if let Err(err) = self.dom.request_memory_reclaim() {
            tracing::debug!(target: "unloader.scheduler", error = %err, "memory reclaim hint failed");
        }
        let pruned = self.virtualizer.prune_orphans();
        self.visible
            .retain(|node| self.virtualizer.registry().is_tracked(*node));
        let released = self.release_detached();
        tracing::debug!(target: "unloader.scheduler", pruned, released, "maintenance tick");
    }

    /// Drop adapter handles to nodes that left the document and that nothing
    /// in the engine still references.
    fn release_detached(&mut self) -> usize {
        let mut live = self.virtualizer.referenced_nodes();
        live.extend(self.container);
        live.extend(self.pending.iter().copied());
        self.dom.release_detached(&|node| live.contains(&node))
    }

    /// Collapse every active entry not last reported inside the viewport
    /// window.
    pub fn force_optimize(&mut self) -> Result<OptimizeReport, UnloaderError> {
        if !self.settings.enabled {
            return Err(UnloaderError::Disabled);
        }
        if self.container.is_none() {
            return Err(UnloaderError::NotStarted);
        }
        let before = self.virtualizer.counts();
        let mut report = OptimizeReport::default();
        let targets: Vec<NodeId> = self
            .virtualizer
            .registry()
            .snapshot()
            .into_iter()
            .filter(|node| !self.visible.contains(node))
            .collect();
        for node in targets {
            match self.collapse_entry(node) {
                CollapseOutcome::Collapsed { .. } => report.collapsed += 1,
                CollapseOutcome::Skipped(_) => report.skipped += 1,
                CollapseOutcome::AlreadyCollapsed | CollapseOutcome::Untracked => {}
            }
        }
        tracing::debug!(
            target: "unloader.scheduler",
            collapsed = report.collapsed,
            skipped = report.skipped,
            "forced optimize"
        );
        self.notify_if_changed(before);
        Ok(report)
    }
}
