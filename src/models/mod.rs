pub mod api;
pub mod image;
pub mod job;
pub mod model;
