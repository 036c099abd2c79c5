pub mod canonical;
pub mod config;
pub mod constants;
pub mod content;
pub mod fetch;
pub mod freshness;
pub mod huggingface;
pub mod logging;
pub mod metrics;
pub mod mirror;
pub mod orchestrator;
pub mod server;
pub mod singleflight;
pub mod store;
pub mod swmr;
pub mod tee;
