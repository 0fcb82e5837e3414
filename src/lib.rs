pub mod agent;
pub mod aggregate;
pub mod beacon;
pub mod clock;
pub mod config;
pub mod error;
pub mod export;
pub mod migrate;
pub mod pipeline;
pub mod schema;
pub mod source;
pub mod store;
