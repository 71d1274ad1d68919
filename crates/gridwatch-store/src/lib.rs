pub mod buildings;
pub mod database;
pub mod jobs;
pub mod kv;
pub mod migrations;
pub mod models;
pub mod power;
pub mod sensors;
pub mod subscribers;

mod error;

pub use database::Store;
pub use error::StoreError;
pub use models::*;
