#![forbid(unsafe_code)]

//! Host command queue.
//!
//! The engine never owns a JS observer. Every [`ObserverHost`] call becomes a
//! [`HostCommand`] pushed onto a [`CommandQueue`]; the JS glue drains the
//! queue after each call into the engine and applies the commands in order.
//! Callbacks travel the other way as JSON-encoded [`SchedulerEvent`]s.

use core::time::Duration;

use serde::{Deserialize, Serialize};
use unloader_core::{Generation, NodeId, ObserverHost, ObserverKind, SchedulerEvent, ViewportMargin};

/// One instruction for the JS glue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum HostCommand {
    /// Create the observer for `generation` with `rootMargin`, replacing any
    /// existing one of the same kind.
    Connect {
        observer: ObserverKind,
        generation: Generation,
        root_margin: String,
    },
    Disconnect { observer: ObserverKind },
    Observe { observer: ObserverKind, node: NodeId },
    Unobserve { observer: ObserverKind, node: NodeId },
    WatchMutations { container: NodeId },
    StopWatchingMutations,
    RequestIdle { generation: Generation },
    StartMaintenance { interval_ms: u64 },
    CancelMaintenance,
}

/// FIFO of pending [`HostCommand`]s. Implements [`ObserverHost`].
#[derive(Debug, Default, Clone)]
pub struct CommandQueue {
    commands: Vec<HostCommand>,
}

impl CommandQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Take every pending command, oldest first.
    pub fn drain(&mut self) -> Vec<HostCommand> {
        std::mem::take(&mut self.commands)
    }

    /// [`Self::drain`] encoded as a JSON array.
    pub fn drain_json(&mut self) -> Result<String, serde_json::Error> {
        let commands = self.drain();
        serde_json::to_string(&commands)
    }

    fn push(&mut self, command: HostCommand) {
        tracing::trace!(target: "unloader.web", ?command, "host command");
        self.commands.push(command);
    }
}

impl ObserverHost for CommandQueue {
    fn connect(&mut self, kind: ObserverKind, generation: Generation, margin: ViewportMargin) {
        self.push(HostCommand::Connect {
            observer: kind,
            generation,
            root_margin: margin.root_margin(),
        });
    }

    fn disconnect(&mut self, kind: ObserverKind) {
        self.push(HostCommand::Disconnect { observer: kind });
    }

    fn observe(&mut self, kind: ObserverKind, target: NodeId) {
        self.push(HostCommand::Observe {
            observer: kind,
            node: target,
        });
    }

    fn unobserve(&mut self, kind: ObserverKind, target: NodeId) {
        self.push(HostCommand::Unobserve {
            observer: kind,
            node: target,
        });
    }

    fn watch_mutations(&mut self, container: NodeId) {
        self.push(HostCommand::WatchMutations { container });
    }

    fn stop_watching_mutations(&mut self) {
        self.push(HostCommand::StopWatchingMutations);
    }

    fn request_idle(&mut self, generation: Generation) {
        self.push(HostCommand::RequestIdle { generation });
    }

    fn start_maintenance(&mut self, interval: Duration) {
        self.push(HostCommand::StartMaintenance {
            interval_ms: u64::try_from(interval.as_millis()).unwrap_or(u64::MAX),
        });
    }

    fn cancel_maintenance(&mut self) {
        self.push(HostCommand::CancelMaintenance);
    }
}

/// Decode a batch of host events. Accepts a JSON array or a single object.
pub fn decode_events(json: &str) -> Result<Vec<SchedulerEvent>, serde_json::Error> {
    let value: serde_json::Value = serde_json::from_str(json)?;
    if value.is_array() {
        serde_json::from_value(value)
    } else {
        serde_json::from_value(value).map(|event| vec![event])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn observer_calls_become_commands_in_order() {
        let mut queue = CommandQueue::new();
        queue.connect(
            ObserverKind::Primary,
            Generation(2),
            ViewportMargin { vertical_px: 1200.0 },
        );
        queue.observe(ObserverKind::Primary, NodeId(7));
        queue.request_idle(Generation(2));
        queue.start_maintenance(Duration::from_secs(30));

        assert_eq!(
            queue.drain(),
            vec![
                HostCommand::Connect {
                    observer: ObserverKind::Primary,
                    generation: Generation(2),
                    root_margin: "1200px 0px".into(),
                },
                HostCommand::Observe {
                    observer: ObserverKind::Primary,
                    node: NodeId(7),
                },
                HostCommand::RequestIdle {
                    generation: Generation(2)
                },
                HostCommand::StartMaintenance { interval_ms: 30_000 },
            ]
        );
        assert!(queue.is_empty());
    }

    #[test]
    fn commands_encode_as_tagged_camel_case() {
        let mut queue = CommandQueue::new();
        queue.connect(
            ObserverKind::Placeholder,
            Generation(1),
            ViewportMargin { vertical_px: 400.0 },
        );
        queue.stop_watching_mutations();
        let json = queue.drain_json().unwrap();
        assert_eq!(
            json,
            r#"[{"op":"connect","observer":"placeholder","generation":1,"rootMargin":"400px 0px"},{"op":"stopWatchingMutations"}]"#
        );
    }

    #[test]
    fn decodes_single_event_or_batch() {
        let one = decode_events(r#"{"type":"tick"}"#).unwrap();
        assert_eq!(one, vec![SchedulerEvent::Tick]);

        let batch = decode_events(
            r#"[{"type":"entryHidden","generation":3,"node":9},{"type":"nodesInserted","nodes":[4,5]}]"#,
        )
        .unwrap();
        assert_eq!(
            batch,
            vec![
                SchedulerEvent::EntryHidden {
                    generation: Generation(3),
                    node: NodeId(9)
                },
                SchedulerEvent::NodesInserted {
                    nodes: vec![NodeId(4), NodeId(5)]
                },
            ]
        );
        assert!(decode_events(r#"{"type":"scroll"}"#).is_err());
    }
}
