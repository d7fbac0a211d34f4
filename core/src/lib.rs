pub mod backend;
pub mod backoff;
pub mod calculator;
pub mod config;
pub mod error;
pub mod guard;
pub mod ledger;
pub mod model;
pub mod money;
pub mod recalc;
pub mod registry;
pub mod simplify;
pub mod store;
pub mod types;
