pub mod common;
pub mod resource;
pub mod status;
pub mod upload;
