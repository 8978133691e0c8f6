pub mod config;
pub mod device;
pub mod measurement;
pub mod mqtt;
pub mod persistence;
