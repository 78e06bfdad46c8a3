use crate::error::MigrateError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// One versioned migration. `up` and `down` are SQL source; the checksum
/// recorded at execution time is `sha256(up + down)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Migration {
    /// Sortable identifier with a `YYYYMMDDHHMMSS_` prefix; lexicographic
    /// order is temporal order.
    pub version: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub target_schemas: Vec<String>,
    /// When absent, the migration applies on whichever cluster serves
    /// each target schema.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_clusters: Option<Vec<String>>,
    pub up: String,
    pub down: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl Migration {
    pub fn checksum(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.up.as_bytes());
        hasher.update(self.down.as_bytes());
        let digest = hasher.finalize();
        digest.iter().map(|b| format!("{b:02x}")).collect()
    }

    /// A migration is valid iff version, name, target schemas, up, and
    /// down are all present.
    pub fn validate(&self) -> Result<(), MigrateError> {
        if self.version.is_empty() {
            return Err(MigrateError::Invalid("version is required".to_string()));
        }
        if self.name.is_empty() {
            return Err(MigrateError::Invalid("name is required".to_string()));
        }
        if self.target_schemas.is_empty() {
            return Err(MigrateError::Invalid(format!(
                "migration '{}' has no target schemas",
                self.version
            )));
        }
        if self.up.is_empty() {
            return Err(MigrateError::Invalid(format!(
                "migration '{}' has no up SQL",
                self.version
            )));
        }
        if self.down.is_empty() {
            return Err(MigrateError::Invalid(format!(
                "migration '{}' has no down SQL",
                self.version
            )));
        }
        Ok(())
    }

    pub fn file_name(&self) -> String {
        format!("{}.json", self.version)
    }

    pub fn targets_cluster(&self, cluster_id: &str) -> bool {
        match &self.target_clusters {
            Some(clusters) => clusters.iter().any(|c| c == cluster_id),
            None => true,
        }
    }

    pub fn targets_schema(&self, schema: &str) -> bool {
        self.target_schemas.iter().any(|s| s == schema)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn migration() -> Migration {
        Migration {
            version: "20240101120000_base".to_string(),
            name: "base".to_string(),
            description: None,
            target_schemas: vec!["users".to_string()],
            target_clusters: None,
            up: "CREATE TABLE accounts (id BIGINT PRIMARY KEY)".to_string(),
            down: "DROP TABLE accounts".to_string(),
            dependencies: vec![],
            tags: vec![],
            created_at: None,
        }
    }

    #[test]
    fn test_checksum_changes_with_source() {
        let m1 = migration();
        let mut m2 = migration();
        assert_eq!(m1.checksum(), m2.checksum());
        m2.down = "DROP TABLE IF EXISTS accounts".to_string();
        assert_ne!(m1.checksum(), m2.checksum());
        assert_eq!(m1.checksum().len(), 64);
    }

    #[test]
    fn test_validate_requires_all_fields() {
        assert!(migration().validate().is_ok());

        let mut m = migration();
        m.target_schemas.clear();
        assert!(m.validate().is_err());

        let mut m = migration();
        m.up.clear();
        assert!(m.validate().is_err());

        let mut m = migration();
        m.down.clear();
        assert!(m.validate().is_err());
    }

    #[test]
    fn test_cluster_targeting_defaults_to_all() {
        let mut m = migration();
        assert!(m.targets_cluster("anything"));
        m.target_clusters = Some(vec!["alpha".to_string()]);
        assert!(m.targets_cluster("alpha"));
        assert!(!m.targets_cluster("beta"));
    }

    #[test]
    fn test_versions_sort_temporally() {
        let mut versions = vec![
            "20240301000000_later".to_string(),
            "20240101120000_base".to_string(),
            "20240101130000_next".to_string(),
        ];
        versions.sort();
        assert_eq!(versions[0], "20240101120000_base");
        assert_eq!(versions[2], "20240301000000_later");
    }

    #[test]
    fn test_serde_rejects_unknown_fields() {
        let json = r#"{"version": "1", "name": "x", "targetSchemas": ["s"],
                       "up": "SELECT 1", "down": "SELECT 1", "sneaky": true}"#;
        assert!(serde_json::from_str::<Migration>(json).is_err());
    }
}
