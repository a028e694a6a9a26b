pub mod app;
pub mod auth;
pub mod config;
pub mod error;
pub mod mail;
pub mod payments;
pub mod sessions;
pub mod state;
pub mod storage;
pub mod store;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
