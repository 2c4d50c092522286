pub mod agent;
pub mod audit;
pub mod compaction;
pub mod config;
pub mod errors;
pub mod manifest;
pub mod orchestrator;
pub mod sandbox;
pub mod scaffold;
pub mod stream;
pub mod telemetry;
