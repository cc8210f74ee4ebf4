//! Domain layer: models and the error taxonomy.

pub mod errors;
pub mod models;
pub mod ports;
