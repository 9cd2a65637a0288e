// === MODULE DEFINITION ===
pub mod module;
pub use module::UsersModule;

// === PUBLIC CONTRACT ===
// Types other modules may depend on: events, the directory service.
pub mod contract;
pub use contract::{User, UserCreated, UserDeleted, UsersDirectory, USERS_DIRECTORY};

// === INTERNAL MODULES ===
// Exposed for tests only.
#[doc(hidden)]
pub mod api;
#[doc(hidden)]
pub mod config;
#[doc(hidden)]
pub mod domain;
