pub mod backend;
pub mod config;
pub mod conversation;
pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod provider;
pub mod retry;
pub mod session;
