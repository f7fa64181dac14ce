use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Rules, Selector};

/// A reusable job blueprint: selectors and rules without a seed URL.
///
/// Instantiating a template copies its selectors and rules into a fresh
/// job pointed at a caller-supplied seed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub selectors: Vec<Selector>,
    #[serde(default)]
    pub rules: Rules,
    pub created_at: DateTime<Utc>,
}

impl Template {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::now_v7().to_string(),
            name: name.into(),
            description: String::new(),
            selectors: Vec::new(),
            rules: Rules::default(),
            created_at: Utc::now(),
        }
    }

    /// Build a job from this template aimed at `base_url`.
    pub fn instantiate(&self, name: impl Into<String>, base_url: impl Into<String>) -> super::Job {
        let mut job = super::Job::new(name, base_url);
        job.selectors = self.selectors.clone();
        job.rules = self.rules.clone();
        job.metadata.insert(
            "template_id".to_string(),
            serde_json::Value::String(self.id.clone()),
        );
        job
    }
}
