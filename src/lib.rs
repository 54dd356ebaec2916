pub mod auth;
pub mod chat;
pub mod conf;
pub mod data;
pub mod docs;
pub mod error;
pub mod logging;
pub mod quota;
pub mod recipes;
pub mod server;
pub mod session;
pub mod types;
