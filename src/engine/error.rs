use ulid::Ulid;

use crate::reconcile::ConsistencyFault;
use crate::resolver::ChannelError;
use crate::store::StoreError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// Malformed or unacceptable input. Not retried.
    Validation(String),
    /// A locally owned entity does not exist.
    NotFound { kind: &'static str, id: Ulid },
    /// One or more cross-service references did not resolve.
    Consistency(ConsistencyFault),
    /// Storage or network failure. Retryable by the caller.
    Infrastructure(String),
}

impl Fault {
    pub fn is_retryable(&self) -> bool {
        match self {
            Fault::Infrastructure(_) => true,
            Fault::Consistency(c) => c.is_retryable(),
            Fault::Validation(_) | Fault::NotFound { .. } => false,
        }
    }

    pub fn kind_label(&self) -> &'static str {
        match self {
            Fault::Validation(_) => "validation",
            Fault::NotFound { .. } => "not_found",
            Fault::Consistency(c) if c.is_retryable() => "consistency_retryable",
            Fault::Consistency(_) => "consistency_terminal",
            Fault::Infrastructure(_) => "infrastructure",
        }
    }

    /// Count the fault and log consistency faults in full.
    pub(crate) fn observed(self) -> Self {
        metrics::counter!(crate::observability::FAULTS_TOTAL, "kind" => self.kind_label())
            .increment(1);
        match &self {
            Fault::Consistency(c) => tracing::warn!("consistency fault: {}", c.to_json()),
            Fault::Infrastructure(e) => tracing::warn!("infrastructure fault: {e}"),
            _ => {}
        }
        self
    }
}

impl std::fmt::Display for Fault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Fault::Validation(msg) => write!(f, "validation failed: {msg}"),
            Fault::NotFound { kind, id } => write!(f, "{kind} not found: {id}"),
            Fault::Consistency(c) => write!(f, "consistency fault: {c}"),
            Fault::Infrastructure(e) => write!(f, "infrastructure fault: {e}"),
        }
    }
}

impl std::error::Error for Fault {}

impl From<StoreError> for Fault {
    fn from(e: StoreError) -> Self {
        Fault::Infrastructure(e.to_string())
    }
}

impl From<ChannelError> for Fault {
    fn from(e: ChannelError) -> Self {
        Fault::Infrastructure(format!("owner channel {e}"))
    }
}

impl From<ConsistencyFault> for Fault {
    fn from(c: ConsistencyFault) -> Self {
        Fault::Consistency(c)
    }
}
