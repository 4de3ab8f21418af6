pub mod account;
pub mod clock;
pub mod config;
pub mod exchange;
pub mod marketdata;
pub mod orchestrator;
pub mod pnl;
pub mod preflight;
pub mod quant;
pub mod telemetry;
pub mod tradews;
