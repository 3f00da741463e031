pub mod api;
pub mod config;
pub mod ledger;
pub mod network;
