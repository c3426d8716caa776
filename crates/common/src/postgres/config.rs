use serde::{Deserialize, Serialize};

/// PostgreSQL connection settings. Pool sizing lives in `PipelineConfig`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostgresConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: String,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            database: "thistle".to_string(),
            username: "thistle".to_string(),
            password: "thistle".to_string(),
        }
    }
}
