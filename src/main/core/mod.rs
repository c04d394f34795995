pub mod configuration;
pub mod logger;
pub mod main;
pub mod scheduler;
pub mod sim_config;
pub mod simulation;
pub mod support;
pub mod work;
