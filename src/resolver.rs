//! Resolution of weak references into entities owned by other services.
//!
//! A reference is an identifier plus the kind of record it points at. The
//! reservation service never owns those records, so every lookup yields one
//! of three outcomes: the record is there, the owner affirmatively says it is
//! not, or nobody can tell yet.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;
use ulid::Ulid;

use crate::model::{Gym, Subscription, User};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReferenceKind {
    Gym,
    Subscription,
    User,
}

impl ReferenceKind {
    pub fn label(self) -> &'static str {
        match self {
            ReferenceKind::Gym => "gym",
            ReferenceKind::Subscription => "subscription",
            ReferenceKind::User => "user",
        }
    }
}

/// Identifier-only pointer into another service's data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WeakRef {
    pub kind: ReferenceKind,
    pub id: Ulid,
}

impl WeakRef {
    pub fn gym(id: Ulid) -> Self {
        Self { kind: ReferenceKind::Gym, id }
    }

    pub fn subscription(id: Ulid) -> Self {
        Self { kind: ReferenceKind::Subscription, id }
    }

    pub fn user(id: Ulid) -> Self {
        Self { kind: ReferenceKind::User, id }
    }
}

impl std::fmt::Display for WeakRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.kind.label(), self.id)
    }
}

/// A record fetched from its owning service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Record {
    Gym(Gym),
    Subscription(Subscription),
    User(User),
}

impl Record {
    pub fn kind(&self) -> ReferenceKind {
        match self {
            Record::Gym(_) => ReferenceKind::Gym,
            Record::Subscription(_) => ReferenceKind::Subscription,
            Record::User(_) => ReferenceKind::User,
        }
    }

    pub fn id(&self) -> Ulid {
        match self {
            Record::Gym(g) => g.id,
            Record::Subscription(s) => s.id,
            Record::User(u) => u.id,
        }
    }
}

/// Why a lookup could not be decided.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Uncertainty {
    /// The local replica has not applied everything the owner has published.
    ReplicaBehind { applied: u64, head: u64 },
    /// The owning service did not answer within the deadline.
    TimedOut,
    /// The owning service answered with a transient failure.
    Transient(String),
}

impl std::fmt::Display for Uncertainty {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Uncertainty::ReplicaBehind { applied, head } => {
                write!(f, "replica behind (applied {applied}, head {head})")
            }
            Uncertainty::TimedOut => write!(f, "owner did not answer in time"),
            Uncertainty::Transient(e) => write!(f, "transient owner failure: {e}"),
        }
    }
}

/// Tri-state outcome of a lookup. Absence and uncertainty are data, not errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution<T> {
    Present(T),
    Absent,
    Indeterminate(Uncertainty),
}

impl<T> Resolution<T> {
    pub fn is_present(&self) -> bool {
        matches!(self, Resolution::Present(_))
    }

    pub fn outcome_label(&self) -> &'static str {
        match self {
            Resolution::Present(_) => "present",
            Resolution::Absent => "absent",
            Resolution::Indeterminate(_) => "indeterminate",
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Resolution<U> {
        match self {
            Resolution::Present(v) => Resolution::Present(f(v)),
            Resolution::Absent => Resolution::Absent,
            Resolution::Indeterminate(u) => Resolution::Indeterminate(u),
        }
    }

    pub fn present(self) -> Option<T> {
        match self {
            Resolution::Present(v) => Some(v),
            _ => None,
        }
    }
}

/// Failure of the channel to an owning service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    Timeout,
    /// Worth asking again shortly.
    Transient(String),
    /// The channel itself is down. Reported as an infrastructure fault.
    Unavailable(String),
}

impl std::fmt::Display for ChannelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelError::Timeout => write!(f, "timed out"),
            ChannelError::Transient(e) => write!(f, "transient: {e}"),
            ChannelError::Unavailable(e) => write!(f, "unavailable: {e}"),
        }
    }
}

impl std::error::Error for ChannelError {}

/// Whatever path reaches the owning service: a local replica or a direct call.
#[async_trait]
pub trait OwnerChannel: Send + Sync {
    async fn fetch(&self, target: WeakRef) -> Result<Resolution<Record>, ChannelError>;
}

/// Bounds every channel call with a deadline and classifies the outcome.
#[derive(Clone)]
pub struct ReferenceResolver {
    channel: Arc<dyn OwnerChannel>,
    timeout: Duration,
}

impl ReferenceResolver {
    pub fn new(channel: Arc<dyn OwnerChannel>, timeout: Duration) -> Self {
        Self { channel, timeout }
    }

    /// Only an unavailable channel is an `Err`; every other failure to decide
    /// is `Indeterminate`, and a timeout is never reported as `Absent`.
    pub async fn resolve(&self, target: WeakRef) -> Result<Resolution<Record>, ChannelError> {
        let started = Instant::now();
        let fetched = match tokio::time::timeout(self.timeout, self.channel.fetch(target)).await {
            Ok(result) => result,
            Err(_) => Err(ChannelError::Timeout),
        };
        metrics::histogram!(
            crate::observability::RESOLVE_DURATION_SECONDS,
            "kind" => target.kind.label()
        )
        .record(started.elapsed().as_secs_f64());

        let resolution = match fetched {
            Ok(Resolution::Present(record))
                if record.kind() != target.kind || record.id() != target.id =>
            {
                tracing::warn!(
                    "{target}: owner returned mismatched record {} {}",
                    record.kind().label(),
                    record.id()
                );
                Resolution::Indeterminate(Uncertainty::Transient("mismatched record".into()))
            }
            Ok(resolution) => resolution,
            Err(ChannelError::Timeout) => Resolution::Indeterminate(Uncertainty::TimedOut),
            Err(ChannelError::Transient(e)) => Resolution::Indeterminate(Uncertainty::Transient(e)),
            Err(unavailable @ ChannelError::Unavailable(_)) => {
                metrics::counter!(
                    crate::observability::RESOLUTIONS_TOTAL,
                    "kind" => target.kind.label(),
                    "outcome" => "unavailable"
                )
                .increment(1);
                return Err(unavailable);
            }
        };
        metrics::counter!(
            crate::observability::RESOLUTIONS_TOTAL,
            "kind" => target.kind.label(),
            "outcome" => resolution.outcome_label()
        )
        .increment(1);
        debug!("resolved {target}: {}", resolution.outcome_label());
        Ok(resolution)
    }

    pub async fn resolve_gym(&self, id: Ulid) -> Result<Resolution<Gym>, ChannelError> {
        Ok(self
            .resolve(WeakRef::gym(id))
            .await?
            .map(|record| match record {
                Record::Gym(g) => Some(g),
                _ => None,
            })
            .flatten_present())
    }

    pub async fn resolve_subscription(
        &self,
        id: Ulid,
    ) -> Result<Resolution<Subscription>, ChannelError> {
        Ok(self
            .resolve(WeakRef::subscription(id))
            .await?
            .map(|record| match record {
                Record::Subscription(s) => Some(s),
                _ => None,
            })
            .flatten_present())
    }

    pub async fn resolve_user(&self, id: Ulid) -> Result<Resolution<User>, ChannelError> {
        Ok(self
            .resolve(WeakRef::user(id))
            .await?
            .map(|record| match record {
                Record::User(u) => Some(u),
                _ => None,
            })
            .flatten_present())
    }
}

impl<T> Resolution<Option<T>> {
    /// `resolve` has already checked the record kind, so `None` cannot occur
    /// here; it is folded into `Absent` rather than trusted blindly.
    fn flatten_present(self) -> Resolution<T> {
        match self {
            Resolution::Present(Some(v)) => Resolution::Present(v),
            Resolution::Present(None) | Resolution::Absent => Resolution::Absent,
            Resolution::Indeterminate(u) => Resolution::Indeterminate(u),
        }
    }
}
