use tracing::info;
use ulid::Ulid;

use crate::model::Reservation;
use crate::reconcile::{FaultDetail, Reconciliation};
use crate::resolver::WeakRef;

use super::{Engine, Fault};

impl Engine {
    /// Book `participant_id` into `session_id`.
    ///
    /// Local checks run before the participant is resolved against the user
    /// service, so a doomed request never costs a cross-service call.
    pub async fn create_reservation(
        &self,
        session_id: Ulid,
        participant_id: Ulid,
    ) -> Result<Reservation, Fault> {
        self.try_create_reservation(session_id, participant_id)
            .await
            .map_err(Fault::observed)
    }

    async fn try_create_reservation(
        &self,
        session_id: Ulid,
        participant_id: Ulid,
    ) -> Result<Reservation, Fault> {
        let session = self.get_session(session_id).await?;
        let taken = self.reservations.count_by_session(session_id).await?;
        if taken >= session.max_participants as usize {
            return Err(Fault::Validation(format!("session {session_id} is full")));
        }

        let participant = WeakRef::user(participant_id);
        let resolution = self.resolver.resolve_user(participant_id).await?;
        let mut rec = Reconciliation::new();
        let Some(user) = rec.check(participant, resolution) else {
            return Err(rec
                .into_fault(FaultDetail::new(
                    "reservation.participant_unresolved",
                    format!("participant {participant_id} not found"),
                ))
                .into());
        };
        if !user.confirmed {
            return Err(Fault::Validation(format!(
                "participant {participant_id} has not confirmed their account"
            )));
        }

        // Capacity and duplicate checks are repeated atomically by the store.
        let reservation = Reservation {
            id: Ulid::new(),
            session_id,
            participant_id,
        };
        self.reservations.add(&reservation).await?;
        metrics::counter!(crate::observability::RESERVATIONS_CREATED_TOTAL).increment(1);
        info!(
            "reservation {} for participant {participant_id} in session {session_id}",
            reservation.id
        );
        Ok(reservation)
    }
}
