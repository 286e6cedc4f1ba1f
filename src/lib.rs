pub mod builder;
pub mod config;
pub mod continuation;
pub mod engine;
pub mod error;
pub mod fetch;
pub mod handlers;
pub mod index;
pub mod planner;
pub mod profile;
pub mod query;
pub mod schema;
pub mod storage;
pub mod types;

pub use config::Config;
pub use engine::BioIndex;
pub use error::{Error, Result};
