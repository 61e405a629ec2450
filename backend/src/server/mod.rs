pub mod agent_state;
pub mod command_dispatcher;
pub mod config;
pub mod core_services;
pub mod metric_buffer;
pub mod ping_scheduler;
pub mod report_cache;
pub mod supervisor;
pub mod terminal;
pub mod timer_groups;
pub mod ws_agent_handler;
