use thiserror::Error;
use tracing_subscriber::filter::FromEnvError;

/// Main error type for omnitap operations
#[derive(Error, Debug)]
pub enum OmnitapError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP request failed: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("Invalid header name: {0}")]
    HeaderName(#[from] reqwest::header::InvalidHeaderName),

    #[error("Invalid header value: {0}")]
    HeaderValue(#[from] reqwest::header::InvalidHeaderValue),

    #[error("JSON serialization error: {0}")]
    SerdeJson(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    SerdeYaml(#[from] serde_yaml::Error),

    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("SQL Server error: {0}")]
    Tiberius(#[from] tiberius::error::Error),

    #[error("MongoDB error: {0}")]
    Mongo(#[from] mongodb::error::Error),

    #[error("Neo4j error: {0}")]
    Neo4j(#[from] neo4rs::Error),

    #[error("Kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    #[error("AMQP error: {0}")]
    Amqp(#[from] lapin::Error),

    #[error("FTP error: {0}")]
    Ftp(#[from] suppaftp::FtpError),

    #[error("SSH error: {0}")]
    Ssh(#[from] ssh2::Error),

    #[error("Task join error: {0}")]
    JoinError(#[from] tokio::task::JoinError),

    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error("Parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error("Serde Arrow error: {0}")]
    SerdeArrow(#[from] serde_arrow::Error),

    #[error("Regex error: {0}")]
    RegexError(#[from] regex::Error),

    #[error("URL parse error: {0}")]
    UrlParseError(#[from] url::ParseError),

    #[error("Tracing From Env Error: {0}")]
    FromEnvError(#[from] FromEnvError),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("unknown protocol: {0}")]
    UnknownProtocol(String),

    #[error("not connected")]
    NotConnected,

    #[error("empty query")]
    EmptyQuery,

    #[error("Connector error: {0}")]
    ConnectorError(String),

    #[error("Staging error: {0}")]
    StagingError(String),

    #[error("Schema error: {0}")]
    SchemaError(String),

    #[error("Load error: {0}")]
    LoadError(String),

    #[error("Audit error: {0}")]
    AuditError(String),

    #[error("Pipeline error: {0}")]
    PipelineError(String),
}

/// Convenience Result type that uses OmnitapError
pub type Result<T> = std::result::Result<T, OmnitapError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = OmnitapError::ConfigError("missing url".to_string());
        assert_eq!(err.to_string(), "Configuration error: missing url");
    }

    #[test]
    fn test_unknown_protocol_message() {
        let err = OmnitapError::UnknownProtocol("carrier-pigeon".to_string());
        assert_eq!(err.to_string(), "unknown protocol: carrier-pigeon");
    }

    #[test]
    fn test_fetch_guard_errors() {
        assert_eq!(OmnitapError::NotConnected.to_string(), "not connected");
        assert_eq!(OmnitapError::EmptyQuery.to_string(), "empty query");
    }
}
