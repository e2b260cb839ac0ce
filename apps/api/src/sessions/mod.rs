pub mod handlers;
pub mod persistence;
pub mod store;
