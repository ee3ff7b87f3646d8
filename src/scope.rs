//! Backup scopes and table resolution
//!
//! `settings ⊆ database`, `data ⊆ database`, `database ⊆ full`;
//! `settings` and `data` never share a table. Only `full` carries the
//! uploads tree.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::backup::{BackupError, BackupResult};
use crate::config::ScopeConfig;
use crate::database::TableSchema;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum BackupScope {
    /// Configuration, templates and service definitions
    Settings,
    /// Clients, matters, documents metadata, financials
    Data,
    /// Every table, no files
    Database,
    /// Every table plus the uploads tree
    Full,
}

impl BackupScope {
    pub const ALL: [BackupScope; 4] = [
        BackupScope::Settings,
        BackupScope::Data,
        BackupScope::Database,
        BackupScope::Full,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BackupScope::Settings => "settings",
            BackupScope::Data => "data",
            BackupScope::Database => "database",
            BackupScope::Full => "full",
        }
    }

    /// Whether everything in `other` is also in `self`
    pub fn includes(&self, other: BackupScope) -> bool {
        match self {
            BackupScope::Full => true,
            BackupScope::Database => other != BackupScope::Full,
            BackupScope::Settings | BackupScope::Data => *self == other,
        }
    }

    pub fn includes_uploads(&self) -> bool {
        *self == BackupScope::Full
    }

    /// Whether tables of `group` belong to this scope
    pub fn covers(&self, group: TableGroup) -> bool {
        match self {
            BackupScope::Settings => group == TableGroup::Settings,
            BackupScope::Data => group == TableGroup::Data,
            BackupScope::Database | BackupScope::Full => true,
        }
    }

    /// Smallest scope consistent with a set of table groups and the
    /// presence of uploaded files
    pub fn implied_by(groups: &[TableGroup], has_uploads: bool) -> BackupScope {
        if has_uploads {
            return BackupScope::Full;
        }
        let settings = groups.iter().any(|g| *g == TableGroup::Settings);
        let data = groups.iter().any(|g| *g == TableGroup::Data);
        match (settings, data) {
            (true, false) => BackupScope::Settings,
            (false, true) => BackupScope::Data,
            _ => BackupScope::Database,
        }
    }
}

impl fmt::Display for BackupScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for BackupScope {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "settings" => Ok(BackupScope::Settings),
            "data" => Ok(BackupScope::Data),
            "database" => Ok(BackupScope::Database),
            "full" => Ok(BackupScope::Full),
            _ => Err(BackupError::invalid_scope(s)),
        }
    }
}

/// Which configured list a table came from
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TableGroup {
    Settings,
    Data,
}

/// Outcome of resolving a scope
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedScope {
    pub scope: BackupScope,
    /// Parent tables before child tables
    pub tables: Vec<String>,
    pub include_uploads: bool,
}

/// Maps scopes onto the configured table lists
#[derive(Debug, Clone)]
pub struct ScopeResolver {
    config: ScopeConfig,
}

impl ScopeResolver {
    pub fn new(config: ScopeConfig) -> BackupResult<Self> {
        config
            .validate()
            .map_err(|e| BackupError::invalid_scope_config(e.to_string()))?;
        Ok(Self { config })
    }

    /// Tables and upload flag for `scope`, in declared order
    pub fn resolve(&self, scope: BackupScope) -> ResolvedScope {
        let tables = match scope {
            BackupScope::Settings => self.config.settings_tables.clone(),
            BackupScope::Data => self.config.data_tables.clone(),
            BackupScope::Database | BackupScope::Full => self
                .config
                .settings_tables
                .iter()
                .chain(self.config.data_tables.iter())
                .cloned()
                .collect(),
        };
        ResolvedScope {
            scope,
            tables,
            include_uploads: scope.includes_uploads(),
        }
    }

    /// Parse a scope name and resolve it
    pub fn resolve_named(&self, scope: &str) -> BackupResult<ResolvedScope> {
        Ok(self.resolve(scope.parse()?))
    }

    pub fn group_of(&self, table: &str) -> Option<TableGroup> {
        if self.config.settings_tables.iter().any(|t| t == table) {
            Some(TableGroup::Settings)
        } else if self.config.data_tables.iter().any(|t| t == table) {
            Some(TableGroup::Data)
        } else {
            None
        }
    }

    /// Stable topological sort: every table comes after the in-scope
    /// tables it references, declared order breaks ties.
    pub fn order_by_dependencies(
        tables: &[String],
        schemas: &[TableSchema],
    ) -> BackupResult<Vec<String>> {
        let in_scope: HashSet<&str> = tables.iter().map(|t| t.as_str()).collect();
        let parents: BTreeMap<&str, Vec<&str>> = schemas
            .iter()
            .map(|s| {
                let deps = s
                    .parent_tables()
                    .filter(|p| in_scope.contains(p))
                    .collect::<Vec<_>>();
                (s.name.as_str(), deps)
            })
            .collect();

        let mut ordered: Vec<String> = Vec::with_capacity(tables.len());
        let mut placed: HashSet<&str> = HashSet::new();

        while ordered.len() < tables.len() {
            let next = tables.iter().find(|t| {
                !placed.contains(t.as_str())
                    && parents
                        .get(t.as_str())
                        .map(|deps| deps.iter().all(|d| placed.contains(d)))
                        .unwrap_or(true)
            });

            match next {
                Some(table) => {
                    placed.insert(table.as_str());
                    ordered.push(table.clone());
                }
                None => {
                    let stuck: Vec<&str> = tables
                        .iter()
                        .map(|t| t.as_str())
                        .filter(|t| !placed.contains(t))
                        .collect();
                    return Err(BackupError::invalid_scope_config(format!(
                        "foreign-key cycle among tables: {}",
                        stuck.join(", ")
                    )));
                }
            }
        }

        Ok(ordered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::BackupErrorCode;
    use crate::database::ColumnKind;

    fn resolver() -> ScopeResolver {
        ScopeResolver::new(ScopeConfig::new(
            &["email_template", "service_catalog"],
            &["client", "matter", "invoice"],
        ))
        .unwrap()
    }

    #[test]
    fn test_scope_monotonicity() {
        let r = resolver();
        let settings = r.resolve(BackupScope::Settings).tables;
        let data = r.resolve(BackupScope::Data).tables;
        let database = r.resolve(BackupScope::Database);
        let full = r.resolve(BackupScope::Full);

        assert!(settings.iter().all(|t| !data.contains(t)));

        let mut union = settings.clone();
        union.extend(data.clone());
        assert_eq!(database.tables, union);
        assert!(!database.include_uploads);

        assert_eq!(full.tables, database.tables);
        assert!(full.include_uploads);
    }

    #[test]
    fn test_includes_lattice() {
        use BackupScope::*;
        assert!(Full.includes(Database));
        assert!(Full.includes(Settings));
        assert!(Database.includes(Data));
        assert!(!Database.includes(Full));
        assert!(!Settings.includes(Data));
        assert!(Data.includes(Data));
    }

    #[test]
    fn test_invalid_scope_rejected() {
        let err = "everything".parse::<BackupScope>().unwrap_err();
        assert_eq!(err.code(), BackupErrorCode::InvalidScope);
        assert!(resolver().resolve_named("tables").is_err());
        assert_eq!("FULL".parse::<BackupScope>().unwrap(), BackupScope::Full);
    }

    #[test]
    fn test_implied_scope() {
        use TableGroup::*;
        assert_eq!(BackupScope::implied_by(&[Settings], false), BackupScope::Settings);
        assert_eq!(BackupScope::implied_by(&[Data, Data], false), BackupScope::Data);
        assert_eq!(BackupScope::implied_by(&[Settings, Data], false), BackupScope::Database);
        assert_eq!(BackupScope::implied_by(&[Settings, Data], true), BackupScope::Full);
    }

    #[test]
    fn test_dependency_order_puts_parents_first() {
        let schemas = vec![
            TableSchema::new("invoice", "id", ColumnKind::Integer)
                .column("matter_id", ColumnKind::Integer)
                .foreign_key("matter_id", "matter", "id"),
            TableSchema::new("matter", "id", ColumnKind::Integer)
                .column("client_id", ColumnKind::Integer)
                .foreign_key("client_id", "client", "id"),
            TableSchema::new("client", "id", ColumnKind::Integer),
            TableSchema::new("tag", "id", ColumnKind::Integer),
        ];
        let declared: Vec<String> = ["invoice", "tag", "matter", "client"]
            .iter()
            .map(|s| s.to_string())
            .collect();

        let ordered = ScopeResolver::order_by_dependencies(&declared, &schemas).unwrap();
        assert_eq!(ordered, vec!["tag", "client", "matter", "invoice"]);
    }

    #[test]
    fn test_dependency_cycle_rejected() {
        let schemas = vec![
            TableSchema::new("a", "id", ColumnKind::Integer)
                .column("b_id", ColumnKind::Integer)
                .foreign_key("b_id", "b", "id"),
            TableSchema::new("b", "id", ColumnKind::Integer)
                .column("a_id", ColumnKind::Integer)
                .foreign_key("a_id", "a", "id"),
        ];
        let declared = vec!["a".to_string(), "b".to_string()];
        assert!(ScopeResolver::order_by_dependencies(&declared, &schemas).is_err());
    }

    #[test]
    fn test_group_of() {
        let r = resolver();
        assert_eq!(r.group_of("email_template"), Some(TableGroup::Settings));
        assert_eq!(r.group_of("matter"), Some(TableGroup::Data));
        assert_eq!(r.group_of("audit"), None);
    }
}
