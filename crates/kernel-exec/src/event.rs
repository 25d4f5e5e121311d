//! Events delivered to the client of one `execute_script` call.

use serde::{Deserialize, Serialize};

use crate::output::{extend_output, OutputItem};
use crate::unit::{CodeUnit, UnitRef};

/// Final output of one unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitResult {
    pub execution_id: String,
    pub index: usize,
    pub line_start: usize,
    pub line_end: usize,
    pub output: Vec<OutputItem>,
    /// Nothing to show: the unit produced no output at all.
    pub invisible: bool,
}

impl UnitResult {
    pub fn new(execution_id: &str, unit: &CodeUnit, output: Vec<OutputItem>) -> Self {
        Self {
            execution_id: execution_id.to_string(),
            index: unit.index,
            line_start: unit.line_start,
            line_end: unit.line_end,
            invisible: output.is_empty(),
            output,
        }
    }

    pub fn has_error(&self) -> bool {
        self.output.iter().any(OutputItem::is_error)
    }
}

/// Progress of one script execution.
///
/// Every execution ends with exactly one terminal event:
/// `Complete`, `Cancelled`, `Error` or `Busy`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    /// All units of the script, before any of them runs.
    Started {
        execution_id: String,
        units: Vec<UnitRef>,
    },
    /// Output the running unit produced since the previous update.
    ///
    /// Stream text continues the last item of the same stream; rebuild the
    /// live view with [`extend_output`](crate::extend_output).
    StreamUpdate {
        execution_id: String,
        index: usize,
        line_start: usize,
        line_end: usize,
        output: Vec<OutputItem>,
    },
    UnitResult(UnitResult),
    /// Units that will never run, after an error or an interrupt.
    Cancelled {
        execution_id: String,
        remaining: Vec<UnitRef>,
    },
    Complete {
        execution_id: String,
    },
    Error {
        execution_id: String,
        message: String,
    },
    /// Rejected: the session was already running a script.
    Busy {
        execution_id: String,
    },
}

impl ClientEvent {
    pub fn execution_id(&self) -> &str {
        match self {
            ClientEvent::Started { execution_id, .. }
            | ClientEvent::StreamUpdate { execution_id, .. }
            | ClientEvent::Cancelled { execution_id, .. }
            | ClientEvent::Complete { execution_id }
            | ClientEvent::Error { execution_id, .. }
            | ClientEvent::Busy { execution_id } => execution_id,
            ClientEvent::UnitResult(result) => &result.execution_id,
        }
    }

    /// Fold a later `StreamUpdate` for the same unit into this one.
    ///
    /// Gives `next` back when the two cannot be combined.
    pub fn merge_update(&mut self, next: ClientEvent) -> Result<(), ClientEvent> {
        match (self, next) {
            (
                ClientEvent::StreamUpdate {
                    execution_id,
                    index,
                    output,
                    ..
                },
                ClientEvent::StreamUpdate {
                    execution_id: next_id,
                    index: next_index,
                    output: added,
                    ..
                },
            ) if *execution_id == next_id && *index == next_index => {
                extend_output(output, added);
                Ok(())
            }
            (_, next) => Err(next),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ClientEvent::Cancelled { .. }
                | ClientEvent::Complete { .. }
                | ClientEvent::Error { .. }
                | ClientEvent::Busy { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_events() {
        let id = "exec-1".to_string();
        assert!(ClientEvent::Complete {
            execution_id: id.clone()
        }
        .is_terminal());
        assert!(ClientEvent::Busy {
            execution_id: id.clone()
        }
        .is_terminal());
        assert!(!ClientEvent::Started {
            execution_id: id,
            units: vec![]
        }
        .is_terminal());
    }

    fn update(index: usize, kind: &str, text: &str) -> ClientEvent {
        ClientEvent::StreamUpdate {
            execution_id: "e".into(),
            index,
            line_start: 1,
            line_end: 1,
            output: vec![OutputItem::new(kind, text)],
        }
    }

    #[test]
    fn test_merge_update_coalesces_streams() {
        let mut first = update(0, "stdout", "a\n");
        first.merge_update(update(0, "stdout", "b\n")).unwrap();
        first.merge_update(update(0, "stderr", "oops\n")).unwrap();
        match &first {
            ClientEvent::StreamUpdate { output, .. } => {
                assert_eq!(output.len(), 2);
                assert_eq!(output[0].content, "a\nb\n");
                assert_eq!(output[1].kind, "stderr");
            }
            other => panic!("unexpected event {:?}", other),
        }

        let other_unit = update(1, "stdout", "c\n");
        assert_eq!(first.merge_update(other_unit.clone()), Err(other_unit));
        let complete = ClientEvent::Complete {
            execution_id: "e".into(),
        };
        assert_eq!(first.merge_update(complete.clone()), Err(complete));
    }

    #[test]
    fn test_unit_result_flattens_into_event() {
        let event = ClientEvent::UnitResult(UnitResult {
            execution_id: "e".into(),
            index: 2,
            line_start: 3,
            line_end: 4,
            output: vec![],
            invisible: true,
        });
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "unit_result");
        assert_eq!(value["index"], 2);
        assert_eq!(value["invisible"], true);

        let back: ClientEvent = serde_json::from_value(value).unwrap();
        assert_eq!(back.execution_id(), "e");
    }
}
