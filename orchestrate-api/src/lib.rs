pub mod api_docs;
pub mod auth;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod routes;
pub mod state;
pub mod watchdog;

pub use config::Config;
pub use dispatcher::start_event_pump_task;
pub use error::{ApiError, ApiResult};
pub use routes::create_app;
pub use state::AppState;
pub use watchdog::{prune_history, run_watchdog_once, start_watchdog_task};
