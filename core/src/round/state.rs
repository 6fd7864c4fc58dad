//! # Round Lifecycle
//!
//! The legal transitions of a round, as a `statig` state machine. The round
//! driver feeds it [`LifecycleEvent`]s and asks it where the round is; it
//! never sets a status itself.
//!
//! ```text
//! registering -> tree_building -> collecting_signatures -> finalizing -> broadcast -> completed
//!                      ^                  |
//!                      +---- rebuild -----+
//! ```
//!
//! Every state before `broadcast` can move to `aborted`. Once the node
//! accepts the funding transaction the round is committed and aborts are
//! ignored.

use super::{AbortCause, RoundStatus, RoundStatuses};
use crate::errors::QuorumError;
use crate::RoundId;
use statig::prelude::*;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    RegistrationClosed { registered: usize },
    /// The tree is built and bound to a funded funding transaction.
    TreeFunded,
    /// Participants were dropped during signing, `remaining` are left.
    ParticipantsExcluded { remaining: usize },
    SignaturesCollected,
    FundingSigned,
    BroadcastAccepted,
    Persisted,
    Abort(AbortCause),
}

#[derive(Debug)]
pub struct RoundLifecycle {
    round_id: RoundId,
    min_participants: usize,
    max_rebuilds: usize,
    rebuilds: usize,
    committed: bool,
    abort_cause: Option<AbortCause>,
    statuses: RoundStatuses,
}

impl RoundLifecycle {
    pub fn new(
        round_id: RoundId,
        min_participants: usize,
        max_rebuilds: usize,
        statuses: RoundStatuses,
    ) -> Self {
        Self {
            round_id,
            min_participants: min_participants.max(1),
            max_rebuilds,
            rebuilds: 0,
            committed: false,
            abort_cause: None,
            statuses,
        }
    }

    pub fn round_id(&self) -> RoundId {
        self.round_id
    }

    /// Number of tree rebuilds so far.
    pub fn rebuilds(&self) -> usize {
        self.rebuilds
    }

    /// Whether the funding transaction was accepted by the node.
    pub fn is_committed(&self) -> bool {
        self.committed
    }

    pub fn abort_cause(&self) -> Option<&AbortCause> {
        self.abort_cause.as_ref()
    }

    fn set_status(&self, status: RoundStatus) {
        match self.statuses.write() {
            Ok(mut statuses) => {
                statuses.insert(self.round_id, status);
            }
            Err(e) => tracing::error!("Round status map is poisoned: {e}"),
        }
    }

    fn abort(&mut self, cause: AbortCause) -> Response<State> {
        tracing::warn!(round_id = self.round_id, "Aborting round: {cause}");
        self.abort_cause = Some(cause);

        Transition(State::aborted())
    }

    fn ignore_abort(&self, cause: &AbortCause) -> Response<State> {
        tracing::error!(
            round_id = self.round_id,
            "Ignoring abort after the funding broadcast: {cause}"
        );

        Handled
    }

    fn unhandled(&self, event: &LifecycleEvent) {
        tracing::error!(
            round_id = self.round_id,
            "Lifecycle event {event:?} is not valid in the current state"
        );
    }
}

impl From<&State> for RoundStatus {
    fn from(state: &State) -> Self {
        match state {
            State::Registering {} => RoundStatus::Registering,
            State::TreeBuilding {} => RoundStatus::TreeBuilding,
            State::CollectingSignatures {} => RoundStatus::CollectingSignatures,
            State::Finalizing {} => RoundStatus::Finalizing,
            State::Broadcast {} => RoundStatus::Broadcast,
            State::Completed {} => RoundStatus::Completed,
            State::Aborted {} => RoundStatus::Aborted,
        }
    }
}

#[state_machine(
    initial = "State::registering()",
    on_transition = "Self::on_transition",
    state(derive(Debug, Clone, PartialEq, Eq))
)]
impl RoundLifecycle {
    #[action]
    fn on_transition(&mut self, source: &State, target: &State) {
        tracing::debug!(
            round_id = self.round_id,
            "Round transitioning from {:?} to {:?}",
            source,
            target
        );
        self.set_status(RoundStatus::from(target));
    }

    /// Aborts and anything else a pre-broadcast state doesn't handle.
    #[superstate]
    async fn cancellable(&mut self, event: &LifecycleEvent) -> Response<State> {
        match event {
            LifecycleEvent::Abort(cause) => self.abort(cause.clone()),
            _ => {
                self.unhandled(event);
                Handled
            }
        }
    }

    #[state(superstate = "cancellable", entry_action = "enter_registering")]
    async fn registering(&mut self, event: &LifecycleEvent) -> Response<State> {
        match event {
            LifecycleEvent::RegistrationClosed { registered } => {
                if *registered < self.min_participants {
                    self.abort(AbortCause::Quorum(QuorumError::Underfilled {
                        registered: *registered,
                        minimum: self.min_participants,
                    }))
                } else {
                    Transition(State::tree_building())
                }
            }
            _ => Super,
        }
    }

    #[action]
    async fn enter_registering(&mut self) {
        self.set_status(RoundStatus::Registering);
    }

    #[state(superstate = "cancellable")]
    async fn tree_building(&mut self, event: &LifecycleEvent) -> Response<State> {
        match event {
            LifecycleEvent::TreeFunded => Transition(State::collecting_signatures()),
            _ => Super,
        }
    }

    #[state(superstate = "cancellable")]
    async fn collecting_signatures(&mut self, event: &LifecycleEvent) -> Response<State> {
        match event {
            LifecycleEvent::SignaturesCollected => Transition(State::finalizing()),
            LifecycleEvent::ParticipantsExcluded { remaining } => {
                if self.rebuilds >= self.max_rebuilds {
                    self.abort(AbortCause::Quorum(QuorumError::RebuildsExhausted(
                        self.rebuilds,
                    )))
                } else if *remaining < self.min_participants {
                    self.abort(AbortCause::Quorum(QuorumError::LostParticipants {
                        remaining: *remaining,
                        minimum: self.min_participants,
                    }))
                } else {
                    self.rebuilds += 1;
                    Transition(State::tree_building())
                }
            }
            _ => Super,
        }
    }

    #[state(superstate = "cancellable")]
    async fn finalizing(&mut self, event: &LifecycleEvent) -> Response<State> {
        match event {
            LifecycleEvent::FundingSigned => Transition(State::broadcast()),
            _ => Super,
        }
    }

    #[state]
    async fn broadcast(&mut self, event: &LifecycleEvent) -> Response<State> {
        match event {
            LifecycleEvent::BroadcastAccepted => {
                self.committed = true;
                Handled
            }
            LifecycleEvent::Persisted if self.committed => Transition(State::completed()),
            LifecycleEvent::Abort(cause) if self.committed => self.ignore_abort(cause),
            LifecycleEvent::Abort(cause) => self.abort(cause.clone()),
            _ => {
                self.unhandled(event);
                Handled
            }
        }
    }

    #[state]
    async fn completed(&mut self, event: &LifecycleEvent) -> Response<State> {
        match event {
            LifecycleEvent::Abort(cause) => self.ignore_abort(cause),
            _ => {
                self.unhandled(event);
                Handled
            }
        }
    }

    #[state]
    async fn aborted(&mut self, event: &LifecycleEvent) -> Response<State> {
        match event {
            // Repeated aborts are harmless.
            LifecycleEvent::Abort(_) => Handled,
            _ => {
                self.unhandled(event);
                Handled
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{ChainError, RejectReason};
    use bitcoin::hashes::Hash;
    use statig::awaitable::{InitializedStateMachine, IntoStateMachineExt};
    use std::collections::BTreeMap;
    use std::sync::{Arc, RwLock};

    async fn machine(
        min_participants: usize,
        max_rebuilds: usize,
    ) -> (InitializedStateMachine<RoundLifecycle>, RoundStatuses) {
        let statuses: RoundStatuses = Arc::new(RwLock::new(BTreeMap::new()));
        let machine = RoundLifecycle::new(7, min_participants, max_rebuilds, statuses.clone())
            .uninitialized_state_machine()
            .init()
            .await;

        (machine, statuses)
    }

    fn status(statuses: &RoundStatuses) -> RoundStatus {
        statuses.read().unwrap()[&7]
    }

    #[tokio::test]
    async fn happy_path_reaches_completed() {
        let (mut m, statuses) = machine(2, 1).await;
        assert_eq!(status(&statuses), RoundStatus::Registering);

        for event in [
            LifecycleEvent::RegistrationClosed { registered: 3 },
            LifecycleEvent::TreeFunded,
            LifecycleEvent::SignaturesCollected,
            LifecycleEvent::FundingSigned,
        ] {
            m.handle(&event).await;
        }
        assert_eq!(*m.state(), State::broadcast());

        // Not committed yet, persistence can't complete the round.
        m.handle(&LifecycleEvent::Persisted).await;
        assert_eq!(*m.state(), State::broadcast());

        m.handle(&LifecycleEvent::BroadcastAccepted).await;
        m.handle(&LifecycleEvent::Persisted).await;
        assert_eq!(*m.state(), State::completed());
        assert_eq!(status(&statuses), RoundStatus::Completed);
        assert!(m.abort_cause().is_none());
    }

    #[tokio::test]
    async fn underfilled_round_aborts() {
        let (mut m, statuses) = machine(2, 1).await;

        m.handle(&LifecycleEvent::RegistrationClosed { registered: 1 })
            .await;
        assert_eq!(*m.state(), State::aborted());
        assert_eq!(status(&statuses), RoundStatus::Aborted);
        assert_eq!(
            m.abort_cause(),
            Some(&AbortCause::Quorum(QuorumError::Underfilled {
                registered: 1,
                minimum: 2
            }))
        );
    }

    #[tokio::test]
    async fn exclusions_rebuild_once_then_abort() {
        let (mut m, _) = machine(2, 1).await;
        m.handle(&LifecycleEvent::RegistrationClosed { registered: 4 })
            .await;
        m.handle(&LifecycleEvent::TreeFunded).await;

        m.handle(&LifecycleEvent::ParticipantsExcluded { remaining: 3 })
            .await;
        assert_eq!(*m.state(), State::tree_building());
        assert_eq!(m.rebuilds(), 1);

        m.handle(&LifecycleEvent::TreeFunded).await;
        m.handle(&LifecycleEvent::ParticipantsExcluded { remaining: 2 })
            .await;
        assert_eq!(*m.state(), State::aborted());
        assert_eq!(
            m.abort_cause(),
            Some(&AbortCause::Quorum(QuorumError::RebuildsExhausted(1)))
        );
    }

    #[tokio::test]
    async fn exclusion_below_quorum_aborts() {
        let (mut m, _) = machine(3, 1).await;
        m.handle(&LifecycleEvent::RegistrationClosed { registered: 3 })
            .await;
        m.handle(&LifecycleEvent::TreeFunded).await;
        m.handle(&LifecycleEvent::ParticipantsExcluded { remaining: 2 })
            .await;

        assert_eq!(*m.state(), State::aborted());
        assert!(matches!(
            m.abort_cause(),
            Some(AbortCause::Quorum(QuorumError::LostParticipants { .. }))
        ));
    }

    #[tokio::test]
    async fn rejected_broadcast_aborts_but_accepted_one_commits() {
        let (mut m, _) = machine(1, 1).await;
        for event in [
            LifecycleEvent::RegistrationClosed { registered: 1 },
            LifecycleEvent::TreeFunded,
            LifecycleEvent::SignaturesCollected,
            LifecycleEvent::FundingSigned,
        ] {
            m.handle(&event).await;
        }
        let rejection = AbortCause::Chain(ChainError::Rejected(
            bitcoin::Txid::all_zeros(),
            RejectReason::InsufficientFee,
        ));
        m.handle(&LifecycleEvent::Abort(rejection.clone())).await;
        assert_eq!(*m.state(), State::aborted());
        assert_eq!(m.abort_cause(), Some(&rejection));

        let (mut m, _) = machine(1, 1).await;
        for event in [
            LifecycleEvent::RegistrationClosed { registered: 1 },
            LifecycleEvent::TreeFunded,
            LifecycleEvent::SignaturesCollected,
            LifecycleEvent::FundingSigned,
            LifecycleEvent::BroadcastAccepted,
        ] {
            m.handle(&event).await;
        }
        m.handle(&LifecycleEvent::Abort(AbortCause::Failure("late".into())))
            .await;
        assert_eq!(*m.state(), State::broadcast());
        assert!(m.is_committed());
        assert!(m.abort_cause().is_none());

        m.handle(&LifecycleEvent::Persisted).await;
        m.handle(&LifecycleEvent::Abort(AbortCause::Failure("later".into())))
            .await;
        assert_eq!(*m.state(), State::completed());
    }

    #[tokio::test]
    async fn out_of_order_events_are_ignored() {
        let (mut m, _) = machine(1, 1).await;

        m.handle(&LifecycleEvent::FundingSigned).await;
        m.handle(&LifecycleEvent::Persisted).await;
        assert_eq!(*m.state(), State::registering());

        m.handle(&LifecycleEvent::Abort(AbortCause::Failure("operator".into())))
            .await;
        assert_eq!(*m.state(), State::aborted());
        m.handle(&LifecycleEvent::RegistrationClosed { registered: 5 })
            .await;
        assert_eq!(*m.state(), State::aborted());
    }
}
