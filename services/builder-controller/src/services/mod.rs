pub mod kaniko;
pub mod staging;
pub mod store;
