//! Brute-force decision core: delay schedule, identity keys, attempt
//! stores and the decision engine.

pub mod clock;
pub mod engine;
pub mod identity;
pub mod policy;
pub mod record;
pub mod reset;
pub mod response;
pub mod schedule;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use engine::{
    Admission, Attempt, Clearance, DecisionEngine, Denial, EngineBuilder, FailureHandler, Outcome,
    Rejection, StoreErrorHandler, StoreFailure,
};
pub use identity::IdentityKey;
pub use policy::{NameSequence, Policy, Transition};
pub use record::AttemptRecord;
pub use reset::{ResetChain, ResetHandle};
pub use response::{retry_after_secs, FailureMode, FailureResponse};
pub use schedule::DelaySchedule;
pub use store::{AtomicIncrement, AttemptStore, MemoryStore, StoreError, TransitionFn};
