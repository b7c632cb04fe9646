pub mod config;
pub mod demonstration;
pub mod gestures;
pub mod messages;
pub mod motor;
pub mod sequence;
pub mod server;
