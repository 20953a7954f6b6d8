pub mod args;
pub mod protocol;
pub mod server;
