pub mod app;
pub mod config;
pub mod effect;
pub mod orchestration;
pub mod provider;
pub mod registry;
pub mod shared;
