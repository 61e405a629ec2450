pub mod handler;
pub mod methods;
pub mod params;
pub mod protocol;
pub mod registry;
