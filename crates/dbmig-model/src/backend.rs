//! Database backend descriptors
//!
//! An installation's data lives either in a dedicated backend (operator
//! managed or single-tenant RDS) or in a slot on a shared multi-tenant
//! instance. Only the latter carry a [`DatabaseId`].

use crate::ids::DatabaseId;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Database backend kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DatabaseKind {
    /// In-cluster MySQL managed by an operator
    #[serde(rename = "mysql-operator")]
    MysqlOperator,
    /// Dedicated RDS MySQL instance
    #[serde(rename = "aws-rds")]
    SingleTenantRdsMysql,
    /// Dedicated RDS Postgres instance
    #[serde(rename = "aws-rds-postgres")]
    SingleTenantRdsPostgres,
    /// Shared RDS MySQL instance
    #[serde(rename = "aws-multitenant-rds")]
    MultiTenantRdsMysql,
    /// Shared RDS Postgres instance
    #[serde(rename = "aws-multitenant-rds-postgres")]
    MultiTenantRdsPostgres,
    /// Shared RDS Postgres instance behind a connection pooler
    #[serde(rename = "aws-multitenant-rds-postgres-pgbouncer")]
    MultiTenantRdsPostgresPgbouncer,
}

impl DatabaseKind {
    /// Every known kind
    pub const ALL: [DatabaseKind; 6] = [
        DatabaseKind::MysqlOperator,
        DatabaseKind::SingleTenantRdsMysql,
        DatabaseKind::SingleTenantRdsPostgres,
        DatabaseKind::MultiTenantRdsMysql,
        DatabaseKind::MultiTenantRdsPostgres,
        DatabaseKind::MultiTenantRdsPostgresPgbouncer,
    ];

    /// Wire name of the kind
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MysqlOperator => "mysql-operator",
            Self::SingleTenantRdsMysql => "aws-rds",
            Self::SingleTenantRdsPostgres => "aws-rds-postgres",
            Self::MultiTenantRdsMysql => "aws-multitenant-rds",
            Self::MultiTenantRdsPostgres => "aws-multitenant-rds-postgres",
            Self::MultiTenantRdsPostgresPgbouncer => "aws-multitenant-rds-postgres-pgbouncer",
        }
    }

    /// Whether installations of this kind occupy a slot on a shared instance
    #[inline]
    #[must_use]
    pub fn is_multi_tenant(self) -> bool {
        matches!(
            self,
            Self::MultiTenantRdsMysql
                | Self::MultiTenantRdsPostgres
                | Self::MultiTenantRdsPostgresPgbouncer
        )
    }
}

impl std::fmt::Display for DatabaseKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unrecognized database kind name
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown database kind: {0}")]
pub struct UnknownDatabaseKind(pub String);

impl FromStr for DatabaseKind {
    type Err = UnknownDatabaseKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| UnknownDatabaseKind(s.to_string()))
    }
}

/// Where an installation's data lives
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BackendDescriptor {
    /// Backend kind
    pub kind: DatabaseKind,
    /// Shared instance, present for multi-tenant kinds once chosen
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_id: Option<DatabaseId>,
}

impl BackendDescriptor {
    /// Dedicated backend (no shared instance)
    #[inline]
    #[must_use]
    pub fn dedicated(kind: DatabaseKind) -> Self {
        Self {
            kind,
            database_id: None,
        }
    }

    /// Slot on a shared instance
    #[inline]
    #[must_use]
    pub fn multi_tenant(kind: DatabaseKind, database_id: impl Into<DatabaseId>) -> Self {
        Self {
            kind,
            database_id: Some(database_id.into()),
        }
    }

    /// Shared instance holding a slot for this backend, if any
    #[inline]
    #[must_use]
    pub fn slot_database(&self) -> Option<&DatabaseId> {
        if self.kind.is_multi_tenant() {
            self.database_id.as_ref()
        } else {
            None
        }
    }
}

impl std::fmt::Display for BackendDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.database_id {
            Some(id) => write!(f, "{}/{}", self.kind, id),
            None => write!(f, "{}", self.kind),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_names_match_serde() {
        for kind in DatabaseKind::ALL {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.as_str()));
            assert_eq!(kind.as_str().parse::<DatabaseKind>().unwrap(), kind);
        }
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let err = "oracle".parse::<DatabaseKind>().unwrap_err();
        assert_eq!(err, UnknownDatabaseKind("oracle".into()));
    }

    #[test]
    fn dedicated_backends_hold_no_slot() {
        let mut backend = BackendDescriptor::dedicated(DatabaseKind::MysqlOperator);
        backend.database_id = Some(DatabaseId::new("stray"));
        assert!(backend.slot_database().is_none());

        let shared = BackendDescriptor::multi_tenant(DatabaseKind::MultiTenantRdsPostgres, "db-1");
        assert_eq!(shared.slot_database().map(DatabaseId::as_str), Some("db-1"));
        assert_eq!(shared.to_string(), "aws-multitenant-rds-postgres/db-1");
    }
}
