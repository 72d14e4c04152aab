pub mod assets;
pub mod catalog;
pub mod config;
pub mod error;
pub mod gallery;
pub mod hub;
pub mod imaging;
pub mod messages;
pub mod models;
pub mod placement;
pub mod room;
pub mod routes;
pub mod session;

pub use error::{Error, Result};
