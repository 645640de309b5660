pub mod config;
pub mod nrmx;
pub mod orchestrator;
pub mod report;
pub mod sim;
pub mod timing;
