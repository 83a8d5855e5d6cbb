pub mod api;
pub mod auth;
pub mod collab;
pub mod config;
pub mod error;
pub mod metrics;
pub mod presence;
pub mod protocol;
pub mod reconnect;
pub mod rooms;
pub mod server;
pub mod unread;
pub mod ws;
