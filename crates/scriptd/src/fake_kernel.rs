//! In-memory kernel for exercising sessions without a Python install.
//!
//! [`FakeKernel`] understands a tiny line-based language, enough to drive
//! every path a real kernel can take:
//!
//! ```text
//! x = 1 + 2            assignment (integers, + - * /)
//! x                    expression, publishes a text/plain result
//! print('hi')          stdout stream; print(x) prints a value
//! display_html('<b>')  display_data with text/html
//! fail('message')      raises RuntimeError
//! sleep(250)           runs for 250ms, interruptible
//! hang()               never finishes and ignores interrupts
//! crash()              the process dies
//! ```
//!
//! Anything else is accepted as a statement with no output. Execution of
//! a request stops at the first error, like an exception would.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use kernel_exec::{KernelMessage, MimeBundle};
use tokio::sync::{watch, Notify};

use crate::kernel::{
    KernelError, KernelFactory, KernelProcess, KernelStream, KernelStreamSender, STREAM_BUFFER,
};

/// Observable state of a fake kernel, shared with tests.
#[derive(Debug, Default)]
pub struct FakeKernelState {
    pub variables: HashMap<String, i64>,
    /// Code of every execute request, in order.
    pub executed: Vec<String>,
    pub starts: usize,
    pub shutdowns: usize,
    pub interrupts: usize,
    /// Execute requests sent while a previous one had not gone idle.
    pub overlapping_executes: usize,
    busy: bool,
}

pub type KernelLedger = Arc<StdMutex<FakeKernelState>>;

pub struct FakeKernel {
    state: KernelLedger,
    alive: Arc<AtomicBool>,
    /// Bumped on every start and shutdown; running requests abandon ship.
    generation: watch::Sender<u64>,
    interrupt: Arc<Notify>,
    fail_start: bool,
}

impl Default for FakeKernel {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeKernel {
    pub fn new() -> Self {
        let (generation, _) = watch::channel(0);
        Self {
            state: Arc::new(StdMutex::new(FakeKernelState::default())),
            alive: Arc::new(AtomicBool::new(false)),
            generation,
            interrupt: Arc::new(Notify::new()),
            fail_start: false,
        }
    }

    /// A kernel whose `start` always fails.
    pub fn failing() -> Self {
        Self {
            fail_start: true,
            ..Self::new()
        }
    }

    pub fn ledger(&self) -> KernelLedger {
        self.state.clone()
    }

    fn bump_generation(&self) {
        let next = *self.generation.borrow() + 1;
        self.generation.send_replace(next);
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut FakeKernelState) -> T) -> Option<T> {
        self.state.lock().ok().map(|mut state| f(&mut state))
    }
}

#[async_trait]
impl KernelProcess for FakeKernel {
    async fn start(&mut self) -> Result<(), KernelError> {
        if self.fail_start {
            return Err(KernelError::Launch("fake kernel configured to fail".into()));
        }
        if self.is_alive() {
            return Ok(());
        }
        self.with_state(|state| {
            state.starts += 1;
            state.variables.clear();
            state.busy = false;
        });
        self.bump_generation();
        self.alive.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn execute(&mut self, code: &str, silent: bool) -> Result<KernelStream, KernelError> {
        if !self.is_alive() {
            return Err(KernelError::NotStarted);
        }
        self.with_state(|state| {
            state.executed.push(code.to_string());
            if state.busy {
                state.overlapping_executes += 1;
            }
            state.busy = true;
        });

        let (tx, stream) = KernelStream::channel(STREAM_BUFFER);
        self.interrupt = Arc::new(Notify::new());
        let run = Run {
            code: code.to_string(),
            silent,
            tx,
            state: self.state.clone(),
            alive: self.alive.clone(),
            interrupt: self.interrupt.clone(),
            generation: self.generation.subscribe(),
        };
        tokio::spawn(run.execute());
        Ok(stream)
    }

    async fn interrupt(&mut self) -> Result<(), KernelError> {
        if !self.is_alive() {
            return Err(KernelError::NotStarted);
        }
        self.with_state(|state| state.interrupts += 1);
        self.interrupt.notify_one();
        Ok(())
    }

    async fn shutdown(&mut self) {
        if self.alive.swap(false, Ordering::SeqCst) {
            self.with_state(|state| {
                state.shutdowns += 1;
                state.busy = false;
            });
        }
        self.bump_generation();
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}

/// One execute request running in the background.
struct Run {
    code: String,
    silent: bool,
    tx: KernelStreamSender,
    state: KernelLedger,
    alive: Arc<AtomicBool>,
    interrupt: Arc<Notify>,
    generation: watch::Receiver<u64>,
}

enum Step {
    Emit(Vec<KernelMessage>),
    Sleep(Duration),
    Hang,
    Crash,
}

impl Run {
    async fn execute(mut self) {
        let _ = self.tx.send(Ok(KernelMessage::busy())).await;

        let lines: Vec<String> = self.code.lines().map(str::to_string).collect();
        for line in lines {
            let step = match self.state.lock() {
                Ok(mut state) => interpret(&line, &mut state.variables),
                Err(_) => return,
            };
            match step {
                Step::Emit(messages) => {
                    let failed = messages
                        .iter()
                        .any(|m| matches!(m, KernelMessage::Error { .. }));
                    for message in messages {
                        if self.silent && matches!(message, KernelMessage::Result { .. }) {
                            continue;
                        }
                        let _ = self.tx.send(Ok(message)).await;
                    }
                    if failed {
                        break;
                    }
                }
                Step::Sleep(duration) => {
                    tokio::select! {
                        _ = tokio::time::sleep(duration) => {}
                        _ = self.interrupt.notified() => {
                            let _ = self.tx.send(Ok(error("KeyboardInterrupt", ""))).await;
                            break;
                        }
                        _ = self.generation.changed() => return,
                    }
                }
                Step::Hang => {
                    let _ = self.generation.changed().await;
                    return;
                }
                Step::Crash => {
                    self.alive.store(false, Ordering::SeqCst);
                    if let Ok(mut state) = self.state.lock() {
                        state.busy = false;
                    }
                    let _ = self.tx.send(Err(KernelError::Died)).await;
                    return;
                }
            }
        }

        if let Ok(mut state) = self.state.lock() {
            state.busy = false;
        }
        let _ = self.tx.send(Ok(KernelMessage::idle())).await;
    }
}

fn error(ename: &str, evalue: &str) -> KernelMessage {
    KernelMessage::Error {
        ename: ename.to_string(),
        evalue: evalue.to_string(),
        traceback: vec![format!("\x1b[0;31m{}\x1b[0m: {}", ename, evalue)],
    }
}

fn call_arg<'a>(line: &'a str, name: &str) -> Option<&'a str> {
    line.strip_prefix(name)?
        .strip_prefix('(')?
        .strip_suffix(')')
        .map(str::trim)
}

fn string_literal(text: &str) -> Option<&str> {
    let text = text.trim();
    text.strip_prefix('\'')
        .and_then(|t| t.strip_suffix('\''))
        .or_else(|| text.strip_prefix('"').and_then(|t| t.strip_suffix('"')))
}

fn is_identifier(text: &str) -> bool {
    let mut chars = text.chars();
    matches!(chars.next(), Some(c) if c.is_alphabetic() || c == '_')
        && chars.all(|c| c.is_alphanumeric() || c == '_')
}

fn interpret(line: &str, variables: &mut HashMap<String, i64>) -> Step {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Step::Emit(vec![]);
    }

    if let Some(arg) = call_arg(line, "print") {
        let text = match string_literal(arg) {
            Some(text) => text.to_string(),
            None => match evaluate(arg, variables) {
                Ok(value) => value.to_string(),
                Err(e) => return Step::Emit(vec![e]),
            },
        };
        return Step::Emit(vec![KernelMessage::stdout(format!("{}\n", text))]);
    }
    if let Some(arg) = call_arg(line, "display_html") {
        let mut data = MimeBundle::new();
        data.insert(
            "text/html".to_string(),
            string_literal(arg).unwrap_or(arg).into(),
        );
        data.insert("text/plain".to_string(), "<HTML>".into());
        return Step::Emit(vec![KernelMessage::Display {
            data,
            metadata: MimeBundle::new(),
        }]);
    }
    if let Some(arg) = call_arg(line, "fail") {
        return Step::Emit(vec![error(
            "RuntimeError",
            string_literal(arg).unwrap_or(arg),
        )]);
    }
    if let Some(arg) = call_arg(line, "sleep") {
        let millis = arg.parse().unwrap_or(0);
        return Step::Sleep(Duration::from_millis(millis));
    }
    if call_arg(line, "hang").is_some() {
        return Step::Hang;
    }
    if call_arg(line, "crash").is_some() {
        return Step::Crash;
    }

    if let Some((name, expr)) = line.split_once('=') {
        let name = name.trim();
        if is_identifier(name) && !expr.starts_with('=') {
            return match evaluate(expr, variables) {
                Ok(value) => {
                    variables.insert(name.to_string(), value);
                    Step::Emit(vec![])
                }
                Err(e) => Step::Emit(vec![e]),
            };
        }
    }

    let looks_like_expression = line
        .chars()
        .all(|c| c.is_alphanumeric() || c == '_' || c.is_whitespace() || "+-*/".contains(c));
    if !looks_like_expression {
        return Step::Emit(vec![]);
    }
    match evaluate(line, variables) {
        Ok(value) => Step::Emit(vec![KernelMessage::plain_result(value.to_string())]),
        Err(e) => Step::Emit(vec![e]),
    }
}

fn evaluate(expr: &str, variables: &HashMap<String, i64>) -> Result<i64, KernelMessage> {
    let expr = expr.trim();
    for op in ['+', '-', '*', '/'] {
        if let Some((left, right)) = expr.split_once(op) {
            if left.trim().is_empty() {
                continue;
            }
            let left = evaluate(left, variables)?;
            let right = evaluate(right, variables)?;
            return match op {
                '+' => Ok(left + right),
                '-' => Ok(left - right),
                '*' => Ok(left * right),
                _ if right == 0 => Err(error("ZeroDivisionError", "division by zero")),
                _ => Ok(left / right),
            };
        }
    }
    if let Ok(value) = expr.parse::<i64>() {
        return Ok(value);
    }
    variables
        .get(expr)
        .copied()
        .ok_or_else(|| error("NameError", &format!("name '{}' is not defined", expr)))
}

/// Hands out fake kernels and keeps a ledger on each for assertions.
#[derive(Clone, Default)]
pub struct FakeKernelFactory {
    ledgers: Arc<StdMutex<Vec<(String, KernelLedger)>>>,
    fail_start: bool,
}

impl FakeKernelFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every kernel this factory creates fails to start.
    pub fn failing() -> Self {
        Self {
            fail_start: true,
            ..Self::default()
        }
    }

    /// State of the most recent kernel created for `session_id`.
    pub fn ledger(&self, session_id: &str) -> Option<KernelLedger> {
        self.ledgers.lock().ok().and_then(|ledgers| {
            ledgers
                .iter()
                .rev()
                .find(|(id, _)| id == session_id)
                .map(|(_, ledger)| ledger.clone())
        })
    }

    pub fn created(&self) -> usize {
        self.ledgers.lock().map(|p| p.len()).unwrap_or(0)
    }
}

impl KernelFactory for FakeKernelFactory {
    type Kernel = FakeKernel;

    fn create(&self, session_id: &str) -> FakeKernel {
        let kernel = if self.fail_start {
            FakeKernel::failing()
        } else {
            FakeKernel::new()
        };
        if let Ok(mut ledgers) = self.ledgers.lock() {
            ledgers.push((session_id.to_string(), kernel.ledger()));
        }
        kernel
    }
}
