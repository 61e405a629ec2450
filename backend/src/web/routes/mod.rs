pub mod admin_routes;
pub mod client_routes;
