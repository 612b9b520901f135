//! Orchestration layer.
//!
//! Everything between the task graph and the worker processes: gating,
//! bounded-concurrency dispatch, worker invocation, result parsing,
//! verification in per-task project overlays, failure recovery and the
//! run-wide budget. The [`Orchestrator`] wires them into the run loop.

pub mod budget;
pub mod dispatcher;
pub mod gate;
pub mod invoker;
pub mod orchestrator;
pub mod overlay;
pub mod parser;
pub mod recovery;
pub mod verifier;

pub use budget::{BudgetTracker, LedgerSnapshot, Reservation};
pub use dispatcher::{
    DispatchEvent, DispatchJob, DispatchReport, Dispatcher, RunContext, TaskOutcome, TaskPipeline,
};
pub use gate::{ComplexityGate, GateDecision};
pub use invoker::{
    Capability, CapabilityOutput, CommandCapability, InvocationError, InvocationErrorKind,
    Invoker, WorkerRequest, WorkerResult, WorkerStatus,
};
pub use orchestrator::{BlockedTask, Orchestrator, RunOutcome, RunReport};
pub use overlay::{Overlay, OVERLAY_DIR};
pub use parser::{
    parse, ChangeAction, CodeChange, Fallback, Finding, ParseFailure, Record, Severity, Shape,
    TestOutcome, WorkerOutput,
};
pub use recovery::{
    FailureCategory, FailureEvidence, RecoveryDecision, RecoveryEngine, RecoveryLevel,
};
pub use verifier::{CheckOutcome, CheckRunner, CommandCheckRunner, RunnerFailure, Verifier};
