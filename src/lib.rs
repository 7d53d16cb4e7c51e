pub mod bridge;
pub mod broker;
pub mod commands;
pub mod config;
pub mod context;
pub mod eligibility;
pub mod error;
pub mod executor;
pub mod feed;
pub mod gateway;
pub mod journal;
pub mod ledger;
pub mod models;
pub mod paper;
pub mod risk;
pub mod state;
pub mod status;
pub mod symbols;
pub mod trading_rules;
pub mod whitelist;

mod retry;
