pub mod app;
pub mod auth;
pub mod config;
pub mod db;
pub mod dispatch;
pub mod error;
pub mod phone;
pub mod reconcile;
pub mod store;
pub mod types;
pub mod whatsapp;
pub mod window;

#[cfg(test)]
mod testing;
