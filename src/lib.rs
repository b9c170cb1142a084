pub mod application;
pub mod auth;
pub mod bulk;
pub mod config;
pub mod http;
pub mod webapi;
