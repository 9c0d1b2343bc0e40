pub mod crds;
pub mod formatters;
pub mod models;
