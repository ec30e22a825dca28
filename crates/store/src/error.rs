use model::destination::UnknownDestinationKind;
use model::upload::UnknownUploadStatus;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("postgres error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    #[error("invalid connection url: {0}")]
    InvalidUrl(String),

    #[error("tls setup failed: {0}")]
    Tls(#[from] native_tls::Error),

    #[error("row {id} carries an unknown status: {source}")]
    BadStatus {
        id: i64,
        #[source]
        source: UnknownUploadStatus,
    },

    #[error("row {id} carries an unknown destination type: {source}")]
    BadDestinationKind {
        id: i64,
        #[source]
        source: UnknownDestinationKind,
    },

    #[error("failed to decode jsonb column '{column}' of row {id}: {source}")]
    BadJson {
        id: i64,
        column: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("cannot serialize upload metadata: {0}")]
    EncodeMetadata(#[source] serde_json::Error),
}
