//! Migration state machine
//!
//! Pure transition logic. The supervisor and the operator-facing service both
//! route every state change through [`apply`]; nothing else decides what the
//! next state is.

use dbmig_model::{MigrationState, TransitionError};

/// Events that drive a migration operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MigrationEvent {
    /// Supervisor picked up a requested operation
    Begin,
    /// Destination slot reserved
    SlotReserved,
    /// Destination slot could not be reserved
    ReservationFailed,
    /// Lifecycle controller reports the installation quiesced
    InstallationPaused,
    /// Copy executor reports success
    CopySucceeded,
    /// Copy executor reports failure
    CopyFailed,
    /// Operator asked to commit
    CommitRequested,
    /// Operator asked to roll back
    RollbackRequested,
    /// Installation repointed to the destination, source slot released
    FinalizeSucceeded,
    /// Installation repointed to the source, destination slot released
    RestoreSucceeded,
    /// Backoff elapsed below the attempt ceiling
    Retry,
    /// Attempt ceiling reached
    RetriesExhausted,
    /// A state handler failed (error, timeout or panic)
    HandlerFailed,
}

impl MigrationEvent {
    /// Every event
    pub const ALL: [MigrationEvent; 13] = [
        MigrationEvent::Begin,
        MigrationEvent::SlotReserved,
        MigrationEvent::ReservationFailed,
        MigrationEvent::InstallationPaused,
        MigrationEvent::CopySucceeded,
        MigrationEvent::CopyFailed,
        MigrationEvent::CommitRequested,
        MigrationEvent::RollbackRequested,
        MigrationEvent::FinalizeSucceeded,
        MigrationEvent::RestoreSucceeded,
        MigrationEvent::Retry,
        MigrationEvent::RetriesExhausted,
        MigrationEvent::HandlerFailed,
    ];

    /// Event name for logs and errors
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Begin => "begin",
            Self::SlotReserved => "slot-reserved",
            Self::ReservationFailed => "reservation-failed",
            Self::InstallationPaused => "installation-paused",
            Self::CopySucceeded => "copy-succeeded",
            Self::CopyFailed => "copy-failed",
            Self::CommitRequested => "commit-requested",
            Self::RollbackRequested => "rollback-requested",
            Self::FinalizeSucceeded => "finalize-succeeded",
            Self::RestoreSucceeded => "restore-succeeded",
            Self::Retry => "retry",
            Self::RetriesExhausted => "retries-exhausted",
            Self::HandlerFailed => "handler-failed",
        }
    }

    /// States in which this event counts as already delivered
    fn applied_in(self) -> &'static [MigrationState] {
        use MigrationState::*;
        match self {
            Self::Begin => &[Reserving],
            Self::SlotReserved => &[Quiescing],
            Self::ReservationFailed | Self::CopyFailed | Self::HandlerFailed => &[Failed],
            Self::InstallationPaused => &[Copying],
            Self::CopySucceeded => &[Migrated],
            Self::CommitRequested => &[Committing, Committed],
            Self::RollbackRequested => &[RollingBack, RolledBack],
            Self::FinalizeSucceeded => &[Committed],
            Self::RestoreSucceeded => &[RolledBack],
            Self::Retry => &[Requested],
            Self::RetriesExhausted => &[Abandoned],
        }
    }
}

impl std::fmt::Display for MigrationEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Outcome of applying an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// State changes
    Applied {
        /// State before
        from: MigrationState,
        /// State after
        to: MigrationState,
    },
    /// Event was already applied; nothing to do
    AlreadyApplied(MigrationState),
}

impl Transition {
    /// Resulting state
    #[inline]
    #[must_use]
    pub fn state(self) -> MigrationState {
        match self {
            Self::Applied { to, .. } => to,
            Self::AlreadyApplied(state) => state,
        }
    }

    /// Whether the caller must persist a new state
    #[inline]
    #[must_use]
    pub fn is_applied(self) -> bool {
        matches!(self, Self::Applied { .. })
    }
}

/// The transition table. `None` means the event is not accepted in `state`.
#[must_use]
pub fn next_state(state: MigrationState, event: MigrationEvent) -> Option<MigrationState> {
    use MigrationEvent as E;
    use MigrationState as S;
    let next = match (state, event) {
        (S::Requested, E::Begin) => S::Reserving,
        (S::Reserving, E::SlotReserved) => S::Quiescing,
        (S::Reserving, E::ReservationFailed) => S::Failed,
        (S::Quiescing, E::InstallationPaused) => S::Copying,
        (S::Copying, E::CopySucceeded) => S::Migrated,
        (S::Copying, E::CopyFailed) => S::Failed,
        (S::Migrated, E::CommitRequested) => S::Committing,
        (S::Migrated, E::RollbackRequested) => S::RollingBack,
        (S::Committing, E::FinalizeSucceeded) => S::Committed,
        (S::RollingBack, E::RestoreSucceeded) => S::RolledBack,
        (S::Failed, E::Retry) => S::Requested,
        (S::Failed, E::RetriesExhausted) => S::Abandoned,
        (S::Requested | S::Reserving | S::Quiescing | S::Copying, E::HandlerFailed) => S::Failed,
        _ => return None,
    };
    Some(next)
}

/// Apply `event` to an operation currently in `state`
///
/// # Errors
/// - `TransitionError::InvalidStateForCancel` for a rollback outside `migrated`
/// - `TransitionError::InvalidStateForCommit` for a commit outside `migrated`
/// - `TransitionError::InvalidTransition` for any other event not in the table
pub fn apply(state: MigrationState, event: MigrationEvent) -> Result<Transition, TransitionError> {
    if event.applied_in().contains(&state) {
        return Ok(Transition::AlreadyApplied(state));
    }

    match next_state(state, event) {
        Some(to) => Ok(Transition::Applied { from: state, to }),
        None => Err(match event {
            MigrationEvent::RollbackRequested => TransitionError::InvalidStateForCancel(state),
            MigrationEvent::CommitRequested => TransitionError::InvalidStateForCommit(state),
            _ => TransitionError::InvalidTransition {
                state,
                event: event.name(),
            },
        }),
    }
}

/// Events accepted (as real transitions) in `state`
#[must_use]
pub fn allowed_events(state: MigrationState) -> Vec<MigrationEvent> {
    MigrationEvent::ALL
        .into_iter()
        .filter(|event| next_state(state, *event).is_some())
        .collect()
}

/// States reachable in one step from `state`
#[must_use]
pub fn allowed_transitions(state: MigrationState) -> Vec<MigrationState> {
    let mut next: Vec<_> = MigrationEvent::ALL
        .into_iter()
        .filter_map(|event| next_state(state, event))
        .collect();
    next.sort();
    next.dedup();
    next
}

/// Validate a raw state change against the table
///
/// # Errors
/// Returns `TransitionError::InvalidTransition` if no event moves `from` to `to`.
pub fn validate_transition(from: MigrationState, to: MigrationState) -> Result<(), TransitionError> {
    if from == to || allowed_transitions(from).contains(&to) {
        Ok(())
    } else {
        Err(TransitionError::InvalidTransition {
            state: from,
            event: "state-change",
        })
    }
}
