pub mod live_status_handler;
pub mod terminal_handler;
