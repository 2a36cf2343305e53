//! End-to-end scenarios for the visibility scheduler against the in-memory
//! document and a recording observer host.

use std::cell::RefCell;
use std::rc::Rc;

use pretty_assertions::assert_eq;
use unloader_core::memory::{HostCall, MemoryDocument, RecordingHost};
use unloader_core::{
    BufferSize, CollapseStrategy, IngestProgress, ManualClock, NodeId, ObserverKind,
    OptimizeReport, RenderAdapter, SchedulerEvent, Settings, SetupOutcome, Stats, UnloaderConfig,
    UnloaderError, ViewportMargin, VisibilityScheduler,
};

type Scheduler = VisibilityScheduler<MemoryDocument, RecordingHost>;

fn role(i: usize) -> &'static str {
    if i % 2 == 0 { "user" } else { "assistant" }
}

fn build(entries: usize, config: UnloaderConfig) -> (Scheduler, Vec<NodeId>) {
    let mut doc = MemoryDocument::new();
    let main = doc.add_container("main");
    let nodes = (0..entries)
        .map(|i| doc.add_entry(main, role(i), &format!("<p>message number {i}</p>"), 150.0))
        .collect();
    let scheduler = VisibilityScheduler::with_clock(
        doc,
        RecordingHost::new(),
        config,
        Settings::default(),
        Box::new(ManualClock::new(1_700_000_000_000)),
    );
    (scheduler, nodes)
}

fn started(entries: usize) -> (Scheduler, Vec<NodeId>) {
    let (mut s, nodes) = build(entries, UnloaderConfig::default());
    assert!(matches!(s.start(), SetupOutcome::Started { .. }));
    drain_idle(&mut s);
    (s, nodes)
}

fn drain_idle(s: &mut Scheduler) {
    while let Some(generation) = s.host_mut().take_idle() {
        s.dispatch(SchedulerEvent::Idle { generation });
    }
}

fn hide(s: &mut Scheduler, node: NodeId) {
    let generation = s.generation();
    s.dispatch(SchedulerEvent::EntryHidden { generation, node });
}

fn is_collapsed(s: &Scheduler, node: NodeId) -> bool {
    s.virtualizer()
        .registry()
        .get(node)
        .is_some_and(|state| state.is_collapsed)
}

fn placeholder_of(s: &Scheduler, node: NodeId) -> NodeId {
    s.virtualizer()
        .registry()
        .get(node)
        .and_then(|state| state.placeholder)
        .expect("collapsed entry has a placeholder")
}

// ── Transcript scenarios ────────────────────────────────────────────────────────

#[test]
fn collapse_middle_of_three() {
    let (mut s, nodes) = started(3);
    let before = s.extract_content(nodes[1]);
    hide(&mut s, nodes[1]);

    let stats = s.stats();
    assert_eq!(stats.counts(), (3, 2, 1));
    assert!(stats.saved_bytes > 0);
    assert_eq!(s.extract_content(nodes[1]), before);
    assert_eq!(before, "message number 1");
}

#[test]
fn buffer_change_moves_placeholder_to_new_observer() {
    let (mut s, nodes) = started(6);
    hide(&mut s, nodes[4]);
    let placeholder = placeholder_of(&s, nodes[4]);
    let old = s.generation();
    assert!(s.host().is_observing(ObserverKind::Placeholder, placeholder));

    let change = s.apply_settings(Settings {
        buffer_size: BufferSize::new(8).unwrap(),
        ..s.settings()
    });
    assert_eq!(change.buffer_size, Some(BufferSize::new(8).unwrap()));
    assert_ne!(s.generation(), old);
    assert_eq!(
        s.host().margin(ObserverKind::Placeholder),
        Some(ViewportMargin { vertical_px: 3200.0 })
    );
    assert_eq!(s.host().generation(ObserverKind::Placeholder), Some(s.generation()));
    assert!(is_collapsed(&s, nodes[4]));
    assert!(s.host().is_observing(ObserverKind::Placeholder, placeholder));
    for node in [nodes[0], nodes[1], nodes[2], nodes[3], nodes[5]] {
        assert!(s.host().is_observing(ObserverKind::Primary, node));
    }

    // The torn-down observer can no longer drive a restore.
    s.dispatch(SchedulerEvent::PlaceholderVisible {
        generation: old,
        placeholder,
    });
    assert!(is_collapsed(&s, nodes[4]));

    let generation = s.generation();
    s.dispatch(SchedulerEvent::PlaceholderVisible {
        generation,
        placeholder,
    });
    assert!(!is_collapsed(&s, nodes[4]));
    assert!(s.dom().is_connected(nodes[4]));
    assert!(s.host().is_observing(ObserverKind::Primary, nodes[4]));
}

#[test]
fn forty_seven_inserted_entries_report_three_chunks() {
    let (mut s, _) = build(0, UnloaderConfig::default());
    let progress = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&progress);
    s.on_progress(move |p| sink.borrow_mut().push(p));
    let SetupOutcome::Started { container, queued } = s.start() else {
        panic!("container should be found");
    };
    assert_eq!(queued, 0);

    let fragment = s.dom_mut().add_group(container);
    let inserted: Vec<NodeId> = (0..47)
        .map(|i| s.dom_mut().add_entry(fragment, role(i), &format!("<p>late {i}</p>"), 80.0))
        .collect();
    s.dispatch(SchedulerEvent::NodesInserted {
        nodes: vec![fragment],
    });
    assert_eq!(s.pending_len(), 47);
    drain_idle(&mut s);

    let seen: Vec<(usize, usize, bool)> = progress
        .borrow()
        .iter()
        .map(|p: &IngestProgress| (p.processed, p.total, p.complete))
        .collect();
    assert_eq!(seen, vec![(20, 47, false), (40, 47, false), (47, 47, true)]);
    assert_eq!(s.stats().total, 47);
    for node in inserted {
        assert!(s.virtualizer().registry().is_tracked(node));
        assert!(s.host().is_observing(ObserverKind::Primary, node));
    }
}

// ── Boundaries ────────────────────────────────────────────────────────────

#[test]
fn empty_transcript_has_zero_stats() {
    let (s, _) = started(0);
    let stats = s.stats();
    assert_eq!(stats.counts(), (0, 0, 0));
    assert_eq!(stats.saved_bytes, 0);
    assert!(s.history().is_empty());
}

#[test]
fn disabling_restores_every_collapsed_entry() {
    let (mut s, nodes) = started(10);
    let generation = s.generation();
    s.dispatch_batch(
        nodes[..6]
            .iter()
            .map(|&node| SchedulerEvent::EntryHidden { generation, node }),
    );
    assert_eq!(s.stats().collapsed, 6);

    let change = s.set_enabled(false);
    assert_eq!(change.enabled, Some(false));
    for node in &nodes {
        assert!(!is_collapsed(&s, *node));
        assert!(s.dom().is_connected(*node));
    }
    assert_eq!(s.stats().saved_bytes, 0);
    assert!(s.history().is_empty());
    assert_eq!(s.host().generation(ObserverKind::Primary), None);
    assert_eq!(s.host().maintenance(), None);
}

#[test]
fn disabled_scheduler_ignores_visibility() {
    let (mut s, nodes) = started(2);
    let _ = s.set_enabled(false);
    hide(&mut s, nodes[0]);
    assert_eq!(s.stats().collapsed, 0);

    // Re-enabling does not collapse retroactively.
    let _ = s.set_enabled(true);
    assert_eq!(s.stats().collapsed, 0);
    assert!(s.host().is_observing(ObserverKind::Primary, nodes[0]));
    hide(&mut s, nodes[0]);
    assert_eq!(s.stats().collapsed, 1);
}

#[test]
fn missing_container_is_not_fatal() {
    let mut s = VisibilityScheduler::new(
        MemoryDocument::new(),
        RecordingHost::new(),
        UnloaderConfig::default(),
        Settings::default(),
    );
    assert_eq!(s.start(), SetupOutcome::ContainerNotFound);
    assert!(s.host().calls().is_empty());

    let main = s.dom_mut().add_container("main");
    let _ = s.dom_mut().add_entry(main, "user", "<p>hi</p>", 20.0);
    assert_eq!(
        s.start(),
        SetupOutcome::Started {
            container: main,
            queued: 1
        }
    );
}

#[test]
fn rebuild_mid_scan_discards_stale_idle_slot() {
    let (mut s, nodes) = build(30, UnloaderConfig::default());
    let progress = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&progress);
    s.on_progress(move |p| sink.borrow_mut().push(p.processed));
    let _ = s.start();

    let first = s.host_mut().take_idle().unwrap();
    s.dispatch(SchedulerEvent::Idle { generation: first });
    assert_eq!(s.pending_len(), 10);

    let _ = s.apply_settings(Settings {
        buffer_size: BufferSize::new(5).unwrap(),
        ..s.settings()
    });
    let stale = s.host_mut().take_idle().unwrap();
    assert_eq!(stale, first);
    s.dispatch(SchedulerEvent::Idle { generation: stale });
    assert_eq!(s.pending_len(), 10);

    drain_idle(&mut s);
    assert_eq!(*progress.borrow(), vec![20, 30]);
    assert_eq!(s.stats().total, 30);
    for node in nodes {
        assert!(s.host().is_observing(ObserverKind::Primary, node));
    }
}

// ── Hooks and user actions ────────────────────────────────────────────────

#[test]
fn stats_hook_fires_once_per_batch() {
    let (mut s, nodes) = started(5);
    let calls: Rc<RefCell<Vec<Stats>>> = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&calls);
    s.on_stats_change(move |stats| sink.borrow_mut().push(*stats));

    let generation = s.generation();
    s.dispatch_batch(
        nodes
            .iter()
            .map(|&node| SchedulerEvent::EntryHidden { generation, node }),
    );
    assert_eq!(calls.borrow().len(), 1);
    assert_eq!(calls.borrow()[0].counts(), (5, 0, 5));

    // A batch that changes nothing stays quiet.
    s.dispatch(SchedulerEvent::EntryHidden {
        generation,
        node: nodes[0],
    });
    s.dispatch(SchedulerEvent::Tick);
    assert_eq!(calls.borrow().len(), 1);
}

#[test]
fn maintenance_swallows_reclaim_failures() {
    let (mut s, _) = started(3);
    s.dom_mut().set_fail_reclaim(true);
    s.dispatch(SchedulerEvent::Tick);
    assert_eq!(s.dom().reclaim_requests(), 1);

    let _ = s.set_enabled(false);
    s.dispatch(SchedulerEvent::Tick);
    assert_eq!(s.dom().reclaim_requests(), 1);
}

#[test]
fn force_optimize_reports_failures() {
    let (mut s, _) = build(2, UnloaderConfig::default());
    assert_eq!(s.force_optimize(), Err(UnloaderError::NotStarted));
    let _ = s.start();
    let _ = s.set_enabled(false);
    assert_eq!(s.force_optimize(), Err(UnloaderError::Disabled));
}

#[test]
fn force_optimize_spares_visible_entries() {
    let (mut s, nodes) = started(4);
    let generation = s.generation();
    s.dispatch_batch([
        SchedulerEvent::EntryVisible {
            generation,
            node: nodes[2],
        },
        SchedulerEvent::EntryVisible {
            generation,
            node: nodes[3],
        },
    ]);
    let report = s.force_optimize().unwrap();
    assert_eq!(report, OptimizeReport { collapsed: 2, skipped: 0 });
    assert!(is_collapsed(&s, nodes[0]));
    assert!(is_collapsed(&s, nodes[1]));
    assert!(!is_collapsed(&s, nodes[2]));
    assert_eq!(s.force_optimize().unwrap(), OptimizeReport::default());
}

#[test]
fn in_place_strategy_restores_on_entry_visible() {
    let config = UnloaderConfig {
        strategy: CollapseStrategy::InPlace,
        ..UnloaderConfig::default()
    };
    let (mut s, nodes) = build(2, config);
    let _ = s.start();
    drain_idle(&mut s);
    hide(&mut s, nodes[0]);
    assert!(is_collapsed(&s, nodes[0]));
    assert!(s.host().is_observing(ObserverKind::Primary, nodes[0]));
    assert!(s.host().observed(ObserverKind::Placeholder).is_empty());

    let generation = s.generation();
    s.dispatch(SchedulerEvent::EntryVisible {
        generation,
        node: nodes[0],
    });
    assert!(!is_collapsed(&s, nodes[0]));
    assert_eq!(s.extract_content(nodes[0]), "message number 0");
}

#[test]
fn reset_conversation_rescans_document() {
    let (mut s, nodes) = started(3);
    hide(&mut s, nodes[0]);
    let outcome = s.reset_conversation();
    assert!(matches!(outcome, SetupOutcome::Started { queued: 3, .. }));
    assert_eq!(s.stats().counts(), (0, 0, 0));
    assert!(s.dom().is_connected(nodes[0]));
    drain_idle(&mut s);
    assert_eq!(s.stats().counts(), (3, 3, 0));
    assert_eq!(s.stats().saved_bytes, 0);
}

#[test]
fn conversation_export_reads_collapsed_entries() {
    let (mut s, nodes) = started(4);
    hide(&mut s, nodes[1]);
    hide(&mut s, nodes[2]);
    let entries = s.extract_all();
    let texts: Vec<&str> = entries.iter().map(|e| e.content.as_str()).collect();
    assert_eq!(
        texts,
        vec![
            "message number 0",
            "message number 1",
            "message number 2",
            "message number 3"
        ]
    );
    let stats = s.conversation_stats();
    assert_eq!(stats.user_messages, 2);
    assert_eq!(stats.assistant_messages, 2);
    assert_eq!(stats.total_words, 12);
}

#[test]
fn dispose_returns_document_to_natural_state() {
    let (mut s, nodes) = started(3);
    hide(&mut s, nodes[1]);
    let (doc, host) = s.dispose();
    assert!(doc.is_connected(nodes[1]));
    assert_eq!(doc.inner_markup(nodes[1]).as_deref(), Some("<p>message number 1</p>"));
    assert!(host.calls().contains(&HostCall::StopWatchingMutations));
    assert_eq!(host.watching(), None);
    assert_eq!(host.maintenance(), None);
}

#[test]
fn ingestion_continues_while_disabled() {
    let (mut s, _) = build(30, UnloaderConfig::default());
    let _ = s.start();
    let generation = s.host_mut().take_idle().expect("initial idle slot");
    s.dispatch(SchedulerEvent::Idle { generation });
    assert_eq!(s.pending_len(), 10);

    let _ = s.set_enabled(false);
    drain_idle(&mut s);
    assert_eq!(s.pending_len(), 0);
    assert_eq!(s.stats().counts(), (30, 30, 0));

    let container = s.container().expect("scheduler is started");
    let late = s.dom_mut().add_entry(container, "user", "<p>late</p>", 40.0);
    s.dispatch(SchedulerEvent::NodesInserted { nodes: vec![late] });
    drain_idle(&mut s);
    assert_eq!(s.stats().counts(), (31, 31, 0));
    assert_eq!(s.extract_all().len(), 31);
    assert!(s.host().observed(ObserverKind::Primary).is_empty());
}

#[test]
fn removed_turns_are_released_once_unreferenced() {
    let mut doc = MemoryDocument::new();
    let main = doc.add_container("main");
    let turns: Vec<NodeId> = (0..2).map(|_| doc.add_group(main)).collect();
    let nodes: Vec<NodeId> = turns
        .iter()
        .enumerate()
        .map(|(i, turn)| doc.add_entry(*turn, role(i), &format!("<p>turn {i}</p>"), 120.0))
        .collect();
    let mut s = VisibilityScheduler::new(
        doc,
        RecordingHost::new(),
        UnloaderConfig::default(),
        Settings::default(),
    );
    let _ = s.start();
    drain_idle(&mut s);
    hide(&mut s, nodes[0]);
    let placeholder = placeholder_of(&s, nodes[0]);
    s.dom_mut().remove(turns[0]);

    // Anchor, placeholder and detached entry are still referenced.
    s.dispatch(SchedulerEvent::Tick);
    assert!(s.dom().contains(turns[0]));
    assert!(s.dom().contains(placeholder));
    assert!(s.dom().contains(nodes[0]));

    let _ = s.set_enabled(false);
    assert!(!s.dom().contains(placeholder));
    let _ = s.set_enabled(true);
    s.dispatch(SchedulerEvent::Tick);
    assert!(!s.dom().contains(turns[0]));
    assert!(s.dom().contains(nodes[0]));

    let _ = s.reset_conversation();
    assert!(!s.dom().contains(nodes[0]));
    assert!(s.dom().contains(nodes[1]));
    drain_idle(&mut s);
    assert_eq!(s.stats().counts(), (1, 1, 0));
}
