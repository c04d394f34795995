#[allow(clippy::module_inception)]
pub mod host;
pub mod network;
pub mod service;
pub mod services;
