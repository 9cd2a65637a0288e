// === MODULE DEFINITION ===
pub mod module;
pub use module::AuditModule;

// === INTERNAL MODULES ===
// Exposed for tests only.
#[doc(hidden)]
pub mod api;
#[doc(hidden)]
pub mod config;
#[doc(hidden)]
pub mod domain;
