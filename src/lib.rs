// ESG Granite
// Library exports

pub mod cli;
pub mod config;
pub mod data;
pub mod dataset;
pub mod inference;
pub mod models;
pub mod training;
