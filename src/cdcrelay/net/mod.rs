pub mod connection;
pub mod events;
pub mod http;
pub mod server;
