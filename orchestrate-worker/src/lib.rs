//! Provisioning workers
//!
//! A worker subscribes to one stage topic, performs the stage's side effect in
//! the tenant project with credentials from the trust store, and publishes
//! exactly one terminal event per dispatched attempt.

pub mod config;
pub mod error;
pub mod handler;
pub mod image;
pub mod instance;
pub mod ledger;
pub mod provider;
pub mod runner;
pub mod template;

pub use config::WorkerConfig;
pub use error::{Result, WorkerError};
pub use handler::{StageContext, StageHandler, StageOutcome};
pub use image::{ImageEndHandler, ImageSpec, ImageStartHandler};
pub use instance::{InstanceEndHandler, InstancePlanner, InstanceRequest, InstanceStartHandler};
pub use ledger::OutcomeLedger;
pub use provider::{
    Accelerator, ComputeProvider, DryRunProvider, Image, ImageCreate, Instance, InstanceSpec,
    InstanceTemplate,
};
pub use runner::{start_worker_task, Worker};
pub use template::{TemplateEndHandler, TemplateSpec, TemplateStartHandler};
