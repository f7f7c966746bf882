pub mod agents;
pub mod clock;
pub mod config;
pub mod config_resolver;
pub mod critique;
pub mod db;
pub mod executor;
pub mod jobs;
pub mod lead_runs;
pub mod pause;
pub mod planner;
pub mod prompt_filter;
pub mod resume;
pub mod schema;
pub mod settings;
pub mod store;
pub mod telemetry;
