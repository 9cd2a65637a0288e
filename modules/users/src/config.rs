use serde::{Deserialize, Serialize};

/// Configuration for the users module (`modules.users`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UsersConfig {
    /// Plan assigned when a create request names none. Must be one of `plans`.
    #[serde(default = "default_plan")]
    pub default_plan: String,
    /// Baseline plans seeded at startup.
    #[serde(default = "default_plans")]
    pub plans: Vec<PlanConfig>,
    #[serde(default = "default_max_page_size")]
    pub max_page_size: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanConfig {
    pub name: String,
    pub max_projects: i64,
}

impl Default for UsersConfig {
    fn default() -> Self {
        Self {
            default_plan: default_plan(),
            plans: default_plans(),
            max_page_size: default_max_page_size(),
        }
    }
}

impl UsersConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_page_size == 0 {
            anyhow::bail!("max_page_size must be positive");
        }
        if !self.plans.iter().any(|p| p.name == self.default_plan) {
            anyhow::bail!(
                "default_plan '{}' is not among the configured plans",
                self.default_plan
            );
        }
        Ok(())
    }
}

fn default_plan() -> String {
    "free".to_string()
}

fn default_plans() -> Vec<PlanConfig> {
    vec![
        PlanConfig {
            name: "free".to_string(),
            max_projects: 3,
        },
        PlanConfig {
            name: "pro".to_string(),
            max_projects: 50,
        },
    ]
}

fn default_max_page_size() -> u32 {
    100
}
