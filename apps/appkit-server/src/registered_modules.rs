// Every module the server runs is listed here; registration order is
// irrelevant, the runtime orders modules by their declared dependencies.

use std::sync::Arc;

use appkit::{Application, RegistryError};

pub fn register_all(app: &mut Application) -> Result<(), RegistryError> {
    app.register(Arc::new(users::UsersModule::default()))?;
    app.register(Arc::new(audit::AuditModule::default()))?;
    Ok(())
}
