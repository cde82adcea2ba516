//! Provisioning workflow engine
//!
//! Owns provisioning requests and drives each one through its start and end
//! stages. Stages run elsewhere; the engine only talks to them through stage
//! events on the bus. Consumed by orchestrate-api and orchestrate-worker.

pub mod bus;
pub mod db;
pub mod engine;
pub mod error;
pub mod policy;
pub mod pump;
pub mod request;
pub mod stage;
pub mod state_machine;
pub mod validation;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use bus::{Delivery, EventBus, SqliteEventBus, Subscription};
pub use engine::{ApplyResult, PruneStats, WorkflowEngine};
pub use error::{ErrorCode, OrchestratorError, Result};
pub use policy::RetryPolicy;
pub use pump::{pump_once, ENGINE_SUBSCRIBER};
pub use request::{
    CancelOutcome, CancelResult, Cancellation, ProvisioningRequest, RequestFilters, RequestKind,
    RequestState, RequestStatus, SubmitRequest, Transition,
};
pub use stage::{DispatchContext, Stage, StageError, StageEvent, StageStatus};
