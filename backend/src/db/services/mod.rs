//! Data access for the persistence port. Every query the rest of the server
//! needs lives here so handlers and workers never build SQL themselves.

pub mod alert_service;
pub mod client_service;
pub mod ping_service;
pub mod record_service;
pub mod renewal_service;
pub mod task_service;
