//! Folding unresolved references into one consistency fault.
//!
//! A workflow step that depends on several references reports them together:
//! a primary, caller-facing fault plus the ordered per-reference causes. Whether
//! the whole is worth retrying is a pure function of the causes.

use serde::{Deserialize, Serialize};

use crate::resolver::{Resolution, WeakRef};

/// Code/description pair, kept verbatim for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultDetail {
    pub code: String,
    pub description: String,
}

impl FaultDetail {
    pub fn new(code: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            description: description.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Cause {
    /// The owner affirmatively reports no such entity.
    Absent,
    /// Not yet visible; may appear once replication catches up.
    Indeterminate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnderlyingFault {
    pub detail: FaultDetail,
    pub cause: Cause,
}

impl UnderlyingFault {
    /// `None` when the reference resolved.
    pub fn from_resolution<T>(target: WeakRef, resolution: &Resolution<T>) -> Option<Self> {
        let kind = target.kind.label();
        match resolution {
            Resolution::Present(_) => None,
            Resolution::Absent => Some(Self {
                detail: FaultDetail::new(
                    format!("{kind}.not_found"),
                    format!("{target} does not exist"),
                ),
                cause: Cause::Absent,
            }),
            Resolution::Indeterminate(why) => Some(Self {
                detail: FaultDetail::new(
                    format!("{kind}.not_yet_visible"),
                    format!("{target} could not be confirmed: {why}"),
                ),
                cause: Cause::Indeterminate,
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FaultClass {
    /// Retrying with backoff could plausibly succeed.
    Retryable,
    /// The referenced entity does not exist; fail fast.
    Terminal,
}

/// Any indeterminate cause makes the aggregate retryable. Otherwise every
/// cause is a confirmed absence (vacuously so for an empty list): terminal.
pub fn classify(underlying: &[UnderlyingFault]) -> FaultClass {
    if underlying.iter().any(|u| u.cause == Cause::Indeterminate) {
        FaultClass::Retryable
    } else {
        FaultClass::Terminal
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsistencyFault {
    pub primary: FaultDetail,
    pub underlying: Vec<UnderlyingFault>,
}

impl ConsistencyFault {
    pub fn class(&self) -> FaultClass {
        classify(&self.underlying)
    }

    pub fn is_retryable(&self) -> bool {
        self.class() == FaultClass::Retryable
    }

    /// The fault as a JSON document, for logs.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| format!("{{\"unserializable\":\"{e}\"}}"))
    }
}

impl std::fmt::Display for ConsistencyFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.primary.code, self.primary.description)?;
        for u in &self.underlying {
            write!(f, "; {}: {}", u.detail.code, u.detail.description)?;
        }
        Ok(())
    }
}

impl std::error::Error for ConsistencyFault {}

pub fn reconcile(primary: FaultDetail, underlying: Vec<UnderlyingFault>) -> ConsistencyFault {
    ConsistencyFault {
        primary,
        underlying,
    }
}

/// Accumulates resolutions for one workflow step, in the order they were made.
#[derive(Debug, Default)]
pub struct Reconciliation {
    underlying: Vec<UnderlyingFault>,
}

impl Reconciliation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `resolution` and hand back the resolved value, if any.
    pub fn check<T>(&mut self, target: WeakRef, resolution: Resolution<T>) -> Option<T> {
        if let Some(fault) = UnderlyingFault::from_resolution(target, &resolution) {
            self.underlying.push(fault);
        }
        resolution.present()
    }

    pub fn is_clean(&self) -> bool {
        self.underlying.is_empty()
    }

    /// `Ok(())` if every reference resolved, else the reconciled fault.
    pub fn finish(self, primary: FaultDetail) -> Result<(), ConsistencyFault> {
        if self.is_clean() {
            Ok(())
        } else {
            Err(self.into_fault(primary))
        }
    }

    pub fn into_fault(self, primary: FaultDetail) -> ConsistencyFault {
        reconcile(primary, self.underlying)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::Uncertainty;
    use ulid::Ulid;

    fn absent() -> UnderlyingFault {
        UnderlyingFault::from_resolution::<()>(WeakRef::user(Ulid::new()), &Resolution::Absent)
            .unwrap()
    }

    fn lagging() -> UnderlyingFault {
        UnderlyingFault::from_resolution::<()>(
            WeakRef::gym(Ulid::new()),
            &Resolution::Indeterminate(Uncertainty::TimedOut),
        )
        .unwrap()
    }

    fn primary() -> FaultDetail {
        FaultDetail::new("reservation.unresolved", "referenced entity not found")
    }

    #[test]
    fn all_absent_is_terminal() {
        let fault = reconcile(primary(), vec![absent(), absent(), absent()]);
        assert_eq!(fault.class(), FaultClass::Terminal);
        assert!(!fault.is_retryable());
    }

    #[test]
    fn any_indeterminate_is_retryable_in_every_position() {
        for n in 1..=4 {
            for pos in 0..n {
                let mut causes: Vec<_> = (0..n).map(|_| absent()).collect();
                causes[pos] = lagging();
                assert_eq!(classify(&causes), FaultClass::Retryable, "n={n} pos={pos}");
                causes.reverse();
                assert_eq!(classify(&causes), FaultClass::Retryable);
            }
        }
        assert_eq!(classify(&[lagging(), lagging()]), FaultClass::Retryable);
    }

    #[test]
    fn empty_cause_list_is_terminal() {
        assert_eq!(classify(&[]), FaultClass::Terminal);
    }

    #[test]
    fn present_contributes_no_cause() {
        assert!(UnderlyingFault::from_resolution(WeakRef::gym(Ulid::new()), &Resolution::Present(1)).is_none());
    }

    #[test]
    fn reconciliation_keeps_order_and_values() {
        let (a, b, c) = (WeakRef::user(Ulid::new()), WeakRef::gym(Ulid::new()), WeakRef::subscription(Ulid::new()));
        let mut rec = Reconciliation::new();
        assert_eq!(rec.check(a, Resolution::Present("ok")), Some("ok"));
        assert!(rec.is_clean());
        assert_eq!(rec.check::<()>(b, Resolution::Absent), None);
        assert_eq!(rec.check::<()>(c, Resolution::Indeterminate(Uncertainty::TimedOut)), None);

        let fault = rec.finish(primary()).unwrap_err();
        let codes: Vec<_> = fault.underlying.iter().map(|u| u.detail.code.as_str()).collect();
        assert_eq!(codes, ["gym.not_found", "subscription.not_yet_visible"]);
        assert!(fault.is_retryable());
    }

    #[test]
    fn json_shape_survives_round_trip() {
        let fault = reconcile(primary(), vec![absent(), lagging()]);
        let parsed: ConsistencyFault = serde_json::from_str(&fault.to_json()).unwrap();
        assert_eq!(parsed, fault);
        assert!(fault.to_string().starts_with("reservation.unresolved: referenced entity not found; user.not_found"));
    }
}
