//! Invocation results and their aggregation

use std::fmt;
use std::time::Duration;

use serde::{Serialize, Serializer};

use crate::bus::EventKind;
use crate::domain::{EntityId, MutationRequest};
use crate::plugin::HandlerOutput;

/// What a plugin was invoked for
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InvocationTarget {
    Event {
        seq: u64,
        kind: EventKind,
        entity_id: EntityId,
    },
    Command {
        name: String,
    },
}

impl fmt::Display for InvocationTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvocationTarget::Event {
                seq,
                kind,
                entity_id,
            } => write!(f, "{} #{} ({})", kind, seq, entity_id),
            InvocationTarget::Command { name } => write!(f, "command {}", name),
        }
    }
}

/// Why an invocation failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// The handler returned an error
    Handler,
    Timeout,
    /// Never started because the run was cancelled
    Cancelled,
    Panicked,
}

impl FailureClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureClass::Handler => "handler",
            FailureClass::Timeout => "timeout",
            FailureClass::Cancelled => "cancelled",
            FailureClass::Panicked => "panicked",
        }
    }
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Success {
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        output: serde_json::Value,
        mutations: Vec<MutationRequest>,
    },
    Failure {
        class: FailureClass,
        message: String,
    },
}

impl Outcome {
    pub fn failure(class: FailureClass, message: impl Into<String>) -> Self {
        Outcome::Failure {
            class,
            message: message.into(),
        }
    }
}

impl From<HandlerOutput> for Outcome {
    fn from(output: HandlerOutput) -> Self {
        Outcome::Success {
            message: output.message,
            output: output.output,
            mutations: output.mutations,
        }
    }
}

/// One plugin's result for one event or command
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InvocationResult {
    pub plugin: String,

    pub target: InvocationTarget,

    pub outcome: Outcome,

    #[serde(rename = "elapsed_ms", serialize_with = "as_millis")]
    pub elapsed: Duration,
}

fn as_millis<S: Serializer>(elapsed: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(elapsed.as_millis() as u64)
}

impl InvocationResult {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, Outcome::Success { .. })
    }

    pub fn failure_class(&self) -> Option<FailureClass> {
        match &self.outcome {
            Outcome::Failure { class, .. } => Some(*class),
            Outcome::Success { .. } => None,
        }
    }

    /// Mutation requests returned by a successful handler
    pub fn mutations(&self) -> &[MutationRequest] {
        match &self.outcome {
            Outcome::Success { mutations, .. } => mutations,
            Outcome::Failure { .. } => &[],
        }
    }
}

/// Every result of one dispatch, ordered by event sequence then load order
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct DispatchReport {
    results: Vec<InvocationResult>,
}

impl DispatchReport {
    pub fn new(results: Vec<InvocationResult>) -> Self {
        Self { results }
    }

    pub fn results(&self) -> &[InvocationResult] {
        &self.results
    }

    pub fn into_results(self) -> Vec<InvocationResult> {
        self.results
    }

    pub fn successes(&self) -> impl Iterator<Item = &InvocationResult> {
        self.results.iter().filter(|r| r.is_success())
    }

    pub fn failures(&self) -> impl Iterator<Item = &InvocationResult> {
        self.results.iter().filter(|r| !r.is_success())
    }

    /// All mutation requests, in result order
    pub fn mutations(&self) -> Vec<MutationRequest> {
        self.results
            .iter()
            .flat_map(|r| r.mutations().iter().cloned())
            .collect()
    }

    pub fn extend(&mut self, other: DispatchReport) {
        self.results.extend(other.results);
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}
