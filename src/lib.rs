mod routes;
mod server;

pub mod agent;
pub mod app;
pub mod camera;
pub mod config;
pub mod cycle;
pub mod llm;
pub mod mcp;
pub mod scheduler;
pub mod telemetry;
pub mod tools;

pub use app::start_app;
