pub mod auth;
pub mod bridge;
pub mod constants;
pub mod db;
pub mod framing;
pub mod health;
pub mod logging;
pub mod routes;
pub mod rows;
pub mod state;
pub mod store;
pub mod types;
pub mod upstream;

pub use types::*;

pub use state::{AppState, Args};
