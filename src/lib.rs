mod routes;

pub mod app;
pub mod broadcast;
pub mod camera;
pub mod config;
pub mod detection;
pub mod estimator;
pub mod frame;
pub mod inference;
pub mod pipeline;
pub mod registry;
pub mod server;
pub mod store;
pub mod telemetry;

pub use app::start_app;
