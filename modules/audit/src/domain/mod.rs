pub mod handler;
pub mod trail;
