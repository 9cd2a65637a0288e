use appkit::{EntityDescriptor, SqlTable};

pub const USERS_TABLE: &str = "users";
pub const PLANS_TABLE: &str = "plans";

/// Tables owned by the users module. Ids and timestamps are stored as text
/// so the same schema works on every backend.
pub fn entities() -> Vec<EntityDescriptor> {
    vec![
        EntityDescriptor::new(
            PLANS_TABLE,
            SqlTable::new()
                .column("name", "TEXT PRIMARY KEY")
                .column("max_projects", "BIGINT NOT NULL"),
        ),
        EntityDescriptor::new(
            USERS_TABLE,
            SqlTable::new()
                .column("id", "TEXT PRIMARY KEY")
                .column("email", "TEXT NOT NULL UNIQUE")
                .column("display_name", "TEXT NOT NULL")
                .column("plan", "TEXT NOT NULL REFERENCES plans(name)")
                .column("created_at", "TEXT NOT NULL")
                .index("users_plan_idx", &["plan"]),
        ),
    ]
}
