pub mod api;
pub mod face;
pub mod job;
pub mod photo;
pub mod search;
