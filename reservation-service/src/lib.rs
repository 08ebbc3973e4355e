pub mod admin;
pub mod api;
pub mod availability;
pub mod cart;
pub mod clock;
pub mod config;
pub mod error;
pub mod manager;
pub mod models;
pub mod schema;
pub mod secret;
pub mod store;
pub mod sweeper;
pub mod trigger;
