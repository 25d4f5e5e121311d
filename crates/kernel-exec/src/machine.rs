//! The kernel execution state machine.
//!
//! [`transition`] is a pure function: given the current [`ExecutionState`]
//! and one [`Input`], it returns the next state and the [`Action`]s the
//! caller must perform. It never talks to a kernel or a client itself,
//! which keeps every ordering rule testable without I/O.
//!
//! Rules enforced here:
//! - A new script is only accepted while idle; otherwise it gets `Busy`.
//! - Exactly one unit is in flight, and the next unit is only dispatched
//!   after the kernel reports idle for the current one.
//! - Static units (markdown literals and syntax errors) are answered
//!   without dispatching anything.
//! - Every accepted script ends with exactly one terminal event.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::event::{ClientEvent, UnitResult};
use crate::message::{KernelActivity, KernelMessage};
use crate::output::{append_stream, error_output, from_mime_bundle, OutputItem};
use crate::unit::{CodeUnit, UnitKind, UnitRef};

/// What to do with the rest of a script after a unit fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPolicy {
    /// Stop and report the unexecuted units as cancelled.
    #[default]
    HaltOnError,
    /// Keep going with the next unit.
    ContinueOnError,
}

/// Why the kernel stopped answering for the running unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LossReason {
    /// Did not reach idle within the grace period after an interrupt.
    Unresponsive,
    /// No output for longer than the per-message timeout.
    TimedOut,
    /// Process exited or the connection broke.
    Crashed,
    /// The owning session is shutting down.
    Closed,
}

/// The script currently being executed.
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveRun {
    pub execution_id: String,
    /// Unit whose execute request is in flight.
    pub current: CodeUnit,
    pub pending: VecDeque<CodeUnit>,
    /// Output of `current` collected so far.
    pub output: Vec<OutputItem>,
    /// Some unit of this script has reported an error.
    pub failed: bool,
    /// The script was cancelled; it ends with `Cancelled` once the kernel is idle.
    pub cancelled: bool,
}

impl ActiveRun {
    fn remaining(&self, include_current: bool) -> Vec<UnitRef> {
        let current = include_current.then(|| self.current.to_ref());
        current
            .into_iter()
            .chain(self.pending.iter().map(CodeUnit::to_ref))
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub enum ExecutionState {
    #[default]
    Idle,
    Running(ActiveRun),
    /// Interrupt sent; waiting for the kernel to go idle.
    Interrupting(ActiveRun),
}

impl ExecutionState {
    pub fn is_idle(&self) -> bool {
        matches!(self, ExecutionState::Idle)
    }

    pub fn active_run(&self) -> Option<&ActiveRun> {
        match self {
            ExecutionState::Idle => None,
            ExecutionState::Running(run) | ExecutionState::Interrupting(run) => Some(run),
        }
    }

    pub fn execution_id(&self) -> Option<&str> {
        self.active_run().map(|run| run.execution_id.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    ExecuteScript {
        execution_id: String,
        units: Vec<CodeUnit>,
    },
    KernelMessage(KernelMessage),
    Interrupt,
    /// Interrupt the running script and report it as cancelled, even when
    /// no units are left.
    Cancel,
    /// Drop the running script without waiting for the kernel.
    ///
    /// The kernel is left mid-execution, so the caller must restart it
    /// before dispatching anything else.
    Abort,
    KernelLost {
        reason: LossReason,
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    ExecuteCode { code: String, silent: bool },
    InterruptKernel,
    SendToClient(ClientEvent),
}

/// Compute the next state and the side effects for one input.
pub fn transition(
    state: ExecutionState,
    input: Input,
    policy: ErrorPolicy,
) -> (ExecutionState, Vec<Action>) {
    let mut actions = Vec::new();

    let next = match (state, input) {
        (ExecutionState::Idle, Input::ExecuteScript { execution_id, units }) => {
            actions.push(Action::SendToClient(ClientEvent::Started {
                execution_id: execution_id.clone(),
                units: units.iter().map(CodeUnit::to_ref).collect(),
            }));
            advance(execution_id, units.into(), false, &mut actions)
        }
        (state, Input::ExecuteScript { execution_id, .. }) => {
            actions.push(Action::SendToClient(ClientEvent::Busy { execution_id }));
            state
        }

        (ExecutionState::Running(run), Input::KernelMessage(message)) => {
            on_message(run, message, false, policy, &mut actions)
        }
        (ExecutionState::Interrupting(run), Input::KernelMessage(message)) => {
            on_message(run, message, true, policy, &mut actions)
        }
        // Nothing in flight: whatever arrives is stale.
        (ExecutionState::Idle, Input::KernelMessage(_)) => ExecutionState::Idle,

        (ExecutionState::Running(run), Input::Interrupt) => {
            actions.push(Action::InterruptKernel);
            ExecutionState::Interrupting(run)
        }
        (state, Input::Interrupt) => state,

        (ExecutionState::Running(mut run), Input::Cancel) => {
            run.cancelled = true;
            actions.push(Action::InterruptKernel);
            ExecutionState::Interrupting(run)
        }
        (ExecutionState::Interrupting(mut run), Input::Cancel) => {
            run.cancelled = true;
            ExecutionState::Interrupting(run)
        }
        (ExecutionState::Idle, Input::Cancel) => ExecutionState::Idle,

        (ExecutionState::Running(run) | ExecutionState::Interrupting(run), Input::Abort) => {
            actions.push(Action::SendToClient(ClientEvent::Cancelled {
                remaining: run.remaining(true),
                execution_id: run.execution_id,
            }));
            ExecutionState::Idle
        }
        (ExecutionState::Idle, Input::Abort) => ExecutionState::Idle,

        (
            ExecutionState::Running(mut run) | ExecutionState::Interrupting(mut run),
            Input::KernelLost { reason, message },
        ) => {
            run.output.push(OutputItem::error(message.clone()));
            actions.push(Action::SendToClient(ClientEvent::UnitResult(
                UnitResult::new(&run.execution_id, &run.current, run.output.clone()),
            )));
            let terminal = match reason {
                LossReason::Unresponsive => ClientEvent::Cancelled {
                    remaining: run.remaining(false),
                    execution_id: run.execution_id,
                },
                LossReason::TimedOut | LossReason::Crashed | LossReason::Closed => {
                    ClientEvent::Error {
                        execution_id: run.execution_id,
                        message,
                    }
                }
            };
            actions.push(Action::SendToClient(terminal));
            ExecutionState::Idle
        }
        (ExecutionState::Idle, Input::KernelLost { .. }) => ExecutionState::Idle,
    };

    (next, actions)
}

fn on_message(
    mut run: ActiveRun,
    message: KernelMessage,
    interrupting: bool,
    policy: ErrorPolicy,
    actions: &mut Vec<Action>,
) -> ExecutionState {
    match message {
        KernelMessage::Stream { name, text } => {
            append_stream(&mut run.output, &name, &text);
            actions.push(stream_update(&run, OutputItem::new(name, text)));
        }
        KernelMessage::Display { data, metadata } => {
            if let Some(item) = from_mime_bundle(&data, &metadata) {
                run.output.push(item.clone());
                actions.push(stream_update(&run, item));
            }
        }
        KernelMessage::Result { data, metadata } => {
            if let Some(item) = from_mime_bundle(&data, &metadata) {
                run.output.push(item);
            }
        }
        KernelMessage::Error {
            ename,
            evalue,
            traceback,
        } => {
            run.output.push(error_output(&ename, &evalue, &traceback));
            run.failed = true;
        }
        KernelMessage::Status {
            state: KernelActivity::Idle,
        } => return finish_unit(run, interrupting, policy, actions),
        KernelMessage::Status { .. } => {}
    }

    if interrupting {
        ExecutionState::Interrupting(run)
    } else {
        ExecutionState::Running(run)
    }
}

/// Only the new output goes out; the full list arrives with `UnitResult`.
fn stream_update(run: &ActiveRun, added: OutputItem) -> Action {
    Action::SendToClient(ClientEvent::StreamUpdate {
        execution_id: run.execution_id.clone(),
        index: run.current.index,
        line_start: run.current.line_start,
        line_end: run.current.line_end,
        output: vec![added],
    })
}

/// The kernel reported idle for the in-flight unit.
fn finish_unit(
    run: ActiveRun,
    interrupting: bool,
    policy: ErrorPolicy,
    actions: &mut Vec<Action>,
) -> ExecutionState {
    let ActiveRun {
        execution_id,
        current,
        pending,
        output,
        failed,
        cancelled,
    } = run;
    let unit_failed = output.iter().any(OutputItem::is_error);
    actions.push(Action::SendToClient(ClientEvent::UnitResult(
        UnitResult::new(&execution_id, &current, output),
    )));

    if cancelled {
        actions.push(Action::SendToClient(ClientEvent::Cancelled {
            execution_id,
            remaining: pending.iter().map(CodeUnit::to_ref).collect(),
        }));
        return ExecutionState::Idle;
    }
    let halted = interrupting || (unit_failed && policy == ErrorPolicy::HaltOnError);
    if halted {
        actions.push(Action::SendToClient(stop_event(execution_id, &pending)));
        return ExecutionState::Idle;
    }
    advance(execution_id, pending, failed, actions)
}

/// `Cancelled` when units are left over, `Complete` when nothing was skipped.
fn stop_event(execution_id: String, pending: &VecDeque<CodeUnit>) -> ClientEvent {
    if pending.is_empty() {
        ClientEvent::Complete { execution_id }
    } else {
        ClientEvent::Cancelled {
            execution_id,
            remaining: pending.iter().map(CodeUnit::to_ref).collect(),
        }
    }
}

/// Answer static units and dispatch the next executable one.
fn advance(
    execution_id: String,
    mut pending: VecDeque<CodeUnit>,
    failed: bool,
    actions: &mut Vec<Action>,
) -> ExecutionState {
    while let Some(unit) = pending.pop_front() {
        let output = match &unit.kind {
            UnitKind::Expression | UnitKind::Statement => {
                actions.push(Action::ExecuteCode {
                    code: unit.source.clone(),
                    silent: false,
                });
                return ExecutionState::Running(ActiveRun {
                    execution_id,
                    current: unit,
                    pending,
                    output: Vec::new(),
                    failed,
                    cancelled: false,
                });
            }
            UnitKind::MarkdownLiteral { text } => vec![OutputItem::markdown(text.clone())],
            // Reported and skipped; the units after it still run.
            UnitKind::SyntaxError { message } => {
                vec![OutputItem::error(format!("SyntaxError: {}", message))]
            }
        };

        let mut result = UnitResult::new(&execution_id, &unit, output);
        // A markdown literal always renders, even when its text is empty.
        result.invisible = false;
        actions.push(Action::SendToClient(ClientEvent::UnitResult(result)));
    }

    actions.push(Action::SendToClient(ClientEvent::Complete { execution_id }));
    ExecutionState::Idle
}

/// Owns an [`ExecutionState`] and feeds inputs through [`transition`].
#[derive(Debug, Default)]
pub struct KernelStateMachine {
    state: ExecutionState,
    policy: ErrorPolicy,
}

impl KernelStateMachine {
    pub fn new(policy: ErrorPolicy) -> Self {
        Self {
            state: ExecutionState::Idle,
            policy,
        }
    }

    pub fn state(&self) -> &ExecutionState {
        &self.state
    }

    pub fn policy(&self) -> ErrorPolicy {
        self.policy
    }

    pub fn handle(&mut self, input: Input) -> Vec<Action> {
        let (next, actions) = transition(std::mem::take(&mut self.state), input, self.policy);
        self.state = next;
        actions
    }

    pub fn on_execute_script(&mut self, execution_id: &str, units: Vec<CodeUnit>) -> Vec<Action> {
        self.handle(Input::ExecuteScript {
            execution_id: execution_id.to_string(),
            units,
        })
    }

    pub fn on_kernel_message(&mut self, message: KernelMessage) -> Vec<Action> {
        self.handle(Input::KernelMessage(message))
    }

    pub fn on_interrupt(&mut self) -> Vec<Action> {
        self.handle(Input::Interrupt)
    }

    pub fn on_cancel(&mut self) -> Vec<Action> {
        self.handle(Input::Cancel)
    }

    pub fn on_abort(&mut self) -> Vec<Action> {
        self.handle(Input::Abort)
    }

    pub fn on_kernel_lost(&mut self, reason: LossReason, message: impl Into<String>) -> Vec<Action> {
        self.handle(Input::KernelLost {
            reason,
            message: message.into(),
        })
    }
}
