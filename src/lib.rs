pub mod config;
pub mod locks;
pub mod model;
pub mod observability;
pub mod service;
pub mod sql;
pub mod store;
pub mod tx;
pub mod wire;
