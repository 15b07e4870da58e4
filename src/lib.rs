pub mod config;
pub mod connection;
pub mod relay;
pub mod store;
pub mod supervisor;
pub mod sync;
pub mod types;
pub mod upstream;
