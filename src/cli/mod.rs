pub mod application;
pub mod types;
