//! Participation request aggregate - typestate model and transitions.

pub mod state;
pub mod transitions;

pub use state::{
    AnyParticipation, Canceled, Confirmed, Participation, ParticipationData, ParticipationState,
    ParticipationStatus, Pending, Rejected, RejectionReason, RequestId,
};
