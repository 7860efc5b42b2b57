pub mod btle;
pub mod connection;
pub mod constants;
pub mod registry;
pub mod testing;
pub mod transport;
pub mod types;
