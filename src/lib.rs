pub mod arg_parser;
pub mod config_manager;
pub mod errors;
pub mod fan_curve;
pub mod fan_manager;
pub mod logger;
pub mod platform;
pub mod scheduler;
pub mod thermal_policy;
