pub mod client;
pub mod common;
pub mod config;
pub mod continue_stream;
pub mod digest;
pub mod error;
pub mod message;
pub mod packet;
pub mod payload;
pub mod receiver;
pub mod registry;
pub mod server;
pub mod service;
pub mod stream;
pub mod workerpool;
