pub mod acquire;
pub mod app;
pub mod authenticator;
pub mod browser;
pub mod callback;
pub mod cli;
pub mod config;
pub mod errors;
pub mod mailbox;
pub mod oauth;
pub mod storage;
pub mod types;
