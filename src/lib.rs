pub mod agent_engine;
pub mod browser;
pub mod config;
pub mod errors;
pub mod trace;
pub mod vision;

pub use agent_engine::navigator::{Navigator, NavigatorConfig, RunFailure, RunReport};
pub use errors::{NavError, NavResult};
pub use vision::types::{Action, BoundingBox, Observation, ReleaseRecord};
