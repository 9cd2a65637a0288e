pub mod entities;
pub mod error;
pub mod service;
