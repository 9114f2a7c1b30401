pub mod agent;
pub mod autonomy;
pub mod config;
pub mod error;
pub mod escalation;
pub mod healer;
pub mod killswitch;
pub mod lane;
pub mod marketplace;
pub mod metrics;
pub mod modules;
pub mod planner;
pub mod policy;
pub mod pricing;
pub mod scheduler;
pub mod snapshot;
pub mod state;
pub mod store;
