use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Warehouse destination kinds this scheduler knows how to route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DestinationKind {
    Redshift,
    BigQuery,
    Snowflake,
    Postgres,
    Clickhouse,
    Mssql,
    AzureSynapse,
    Deltalake,
    S3Datalake,
    GcsDatalake,
    AzureDatalake,
}

/// Format of the load files the downstream loader produces for a kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadFileType {
    Csv,
    Json,
    Parquet,
}

impl fmt::Display for LoadFileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LoadFileType::Csv => "csv",
            LoadFileType::Json => "json",
            LoadFileType::Parquet => "parquet",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
#[error("unknown warehouse destination kind: {0}")]
pub struct UnknownDestinationKind(pub String);

pub const ALL_KINDS: [DestinationKind; 11] = [
    DestinationKind::Redshift,
    DestinationKind::BigQuery,
    DestinationKind::Snowflake,
    DestinationKind::Postgres,
    DestinationKind::Clickhouse,
    DestinationKind::Mssql,
    DestinationKind::AzureSynapse,
    DestinationKind::Deltalake,
    DestinationKind::S3Datalake,
    DestinationKind::GcsDatalake,
    DestinationKind::AzureDatalake,
];

impl DestinationKind {
    /// Wire name used by the control plane and stored in
    /// `wh_uploads.destination_type`.
    pub fn as_str(&self) -> &'static str {
        match self {
            DestinationKind::Redshift => "RS",
            DestinationKind::BigQuery => "BQ",
            DestinationKind::Snowflake => "SNOWFLAKE",
            DestinationKind::Postgres => "POSTGRES",
            DestinationKind::Clickhouse => "CLICKHOUSE",
            DestinationKind::Mssql => "MSSQL",
            DestinationKind::AzureSynapse => "AZURE_SYNAPSE",
            DestinationKind::Deltalake => "DELTALAKE",
            DestinationKind::S3Datalake => "S3_DATALAKE",
            DestinationKind::GcsDatalake => "GCS_DATALAKE",
            DestinationKind::AzureDatalake => "AZURE_DATALAKE",
        }
    }

    /// Lower-case name used to scope per-kind configuration keys.
    pub fn config_name(&self) -> &'static str {
        match self {
            DestinationKind::Redshift => "redshift",
            DestinationKind::BigQuery => "bigquery",
            DestinationKind::Snowflake => "snowflake",
            DestinationKind::Postgres => "postgres",
            DestinationKind::Clickhouse => "clickhouse",
            DestinationKind::Mssql => "mssql",
            DestinationKind::AzureSynapse => "azure_synapse",
            DestinationKind::Deltalake => "deltalake",
            DestinationKind::S3Datalake => "s3_datalake",
            DestinationKind::GcsDatalake => "gcs_datalake",
            DestinationKind::AzureDatalake => "azure_datalake",
        }
    }

    pub fn load_file_type(&self) -> LoadFileType {
        match self {
            DestinationKind::BigQuery => LoadFileType::Json,
            DestinationKind::Deltalake
            | DestinationKind::S3Datalake
            | DestinationKind::GcsDatalake
            | DestinationKind::AzureDatalake => LoadFileType::Parquet,
            _ => LoadFileType::Csv,
        }
    }

    /// Kinds whose loaders leave partial state behind (temp tables and the
    /// like) and therefore participate in crash recovery at startup.
    pub fn crash_recoverable(&self) -> bool {
        matches!(
            self,
            DestinationKind::Redshift
                | DestinationKind::Postgres
                | DestinationKind::Mssql
                | DestinationKind::AzureSynapse
                | DestinationKind::Deltalake
        )
    }

    /// Snowflake stores object names upper-cased; everyone else keeps the
    /// namespace as derived.
    pub fn uppercases_namespace(&self) -> bool {
        matches!(self, DestinationKind::Snowflake)
    }
}

impl fmt::Display for DestinationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DestinationKind {
    type Err = UnknownDestinationKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ALL_KINDS
            .iter()
            .copied()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| UnknownDestinationKind(s.to_string()))
    }
}
