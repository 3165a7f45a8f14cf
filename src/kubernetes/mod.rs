pub mod api;
pub mod controller;
pub mod error;
pub mod injection;
pub mod lifecycle;
pub mod mapper;
#[cfg(test)]
pub mod memory;
pub mod resolver;
pub mod revision;
pub mod revision_tag;
pub mod status;
pub mod usage;

pub use controller::start_controller;
