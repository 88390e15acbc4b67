//! Core data model and wire protocol shared by the proposer: terms, LSNs, identifiers,
//! feedback, and the proposer/acceptor message set described in the protocol spec.

pub mod feedback;
pub mod ids;
pub mod lsn;
pub mod proto;
pub mod term;

pub use feedback::{HotStandbyFeedback, PageserverFeedback};
pub use ids::{NodeId, ProposerId, TenantId, TimelineId};
pub use lsn::Lsn;
pub use term::{Term, TermHistory, TermLsn, INVALID_TERM};
