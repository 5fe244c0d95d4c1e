pub mod auth;
pub mod ride;
pub mod token;
