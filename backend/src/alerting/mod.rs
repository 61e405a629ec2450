pub mod evaluation_service;
pub mod expiry_watcher;
pub mod offline_monitor;
pub mod traffic_monitor;
