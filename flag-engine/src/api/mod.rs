pub mod admin;
pub mod endpoint;
pub mod errors;
pub mod types;
