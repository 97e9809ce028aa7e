pub mod connection;
pub mod endpoints;
pub mod engine;
pub mod id_cache;
pub mod multiplexer;
pub mod server;
