pub mod models;
pub mod start;
