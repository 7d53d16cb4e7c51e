pub mod check_config;
pub mod generate_whitelist;
pub mod reconcile;
pub mod run;
pub mod status;
