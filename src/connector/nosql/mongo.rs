//! MongoDB connector: cached driver client, query dispatch against one
//! collection, BSON → JSON flattening with stringified object ids.

use async_trait::async_trait;
use futures::TryStreamExt;
use mongodb::bson::{doc, Bson, Document};
use mongodb::Client;
use serde::Deserialize;
use serde_json::{Number, Value};
use tracing::{debug, info};

use crate::cache::{normalized_key, MONGO_CLIENTS};
use crate::config::{expect_str, get_bool, get_str, require_keys, ConfigMap};
use crate::connector::{guard_fetch, Connector};
use crate::envelope::{IngestedItem, IngestionResult, Row};
use crate::errors::{OmnitapError, Result};

pub fn factory(config: ConfigMap) -> Result<Box<dyn Connector>> {
    Ok(Box::new(MongoConnector::from_config(config)?))
}

const IDENTITY_FIELDS: &[&str] = &["uri", "host", "port", "user", "password"];

/// Structured fetch query. A bare string is treated as a collection name
/// with an empty filter.
#[derive(Debug, Deserialize)]
struct MongoQuery {
    collection: String,
    #[serde(default)]
    filter: Value,
    #[serde(default)]
    limit: Option<i64>,
}

#[derive(Debug)]
pub struct MongoConnector {
    config: ConfigMap,
    client: Option<Client>,
}

impl MongoConnector {
    pub fn from_config(config: ConfigMap) -> Result<Self> {
        require_keys(&config, &["database"])?;
        if !config.contains_key("uri") && !config.contains_key("host") {
            return Err(OmnitapError::ConfigError(
                "missing required keys: [uri] (or [host])".to_string(),
            ));
        }
        Ok(Self {
            config,
            client: None,
        })
    }

    fn uri(&self) -> String {
        if let Some(uri) = get_str(&self.config, "uri") {
            return uri;
        }
        let host = get_str(&self.config, "host").unwrap_or_else(|| "localhost".to_string());
        let port = get_str(&self.config, "port").unwrap_or_else(|| "27017".to_string());
        format!("mongodb://{host}:{port}")
    }
}

#[async_trait]
impl Connector for MongoConnector {
    fn protocol(&self) -> &str {
        "mongodb"
    }

    async fn connect(&mut self) -> Result<()> {
        let reuse = get_bool(&self.config, "reuse").unwrap_or(true);
        let key = normalized_key("mongodb", &self.config, IDENTITY_FIELDS);
        let uri = self.uri();

        let client = MONGO_CLIENTS
            .get_or_try_init(&key, reuse, || async move {
                let client = Client::with_uri_str(&uri).await?;
                Ok(client)
            })
            .await?;

        info!(
            uri = %crate::log::redact_url(&self.uri()),
            "mongodb connector connected"
        );
        self.client = Some(client);
        Ok(())
    }

    async fn fetch(&mut self, query: &str) -> Result<IngestionResult> {
        guard_fetch(self.client.is_some(), query)?;
        let client = self.client.as_ref().ok_or(OmnitapError::NotConnected)?;
        let database = client.database(&expect_str(&self.config, "database")?);

        let spec: MongoQuery = match serde_json::from_str(query) {
            Ok(spec) => spec,
            Err(_) => MongoQuery {
                collection: query.trim().to_string(),
                filter: Value::Null,
                limit: None,
            },
        };
        debug!(collection = spec.collection, "mongodb fetch");

        let filter: Document = match &spec.filter {
            Value::Null => doc! {},
            other => match mongodb::bson::to_document(other) {
                Ok(document) => document,
                Err(e) => {
                    return Ok(IngestionResult::failure(
                        "mongodb",
                        format!("invalid filter: {e}"),
                    ))
                }
            },
        };

        let collection = database.collection::<Document>(&spec.collection);
        let mut find = collection.find(filter);
        if let Some(limit) = spec.limit {
            find = find.limit(limit);
        }

        let mut cursor = match find.await {
            Ok(cursor) => cursor,
            Err(e) => return Ok(IngestionResult::failure("mongodb", e.to_string())),
        };

        let mut rows: Vec<Row> = Vec::new();
        loop {
            match cursor.try_next().await {
                Ok(Some(document)) => rows.push(document_to_row(document)),
                Ok(None) => break,
                Err(e) => return Ok(IngestionResult::failure("mongodb", e.to_string())),
            }
        }

        let count = rows.len();
        Ok(
            IngestionResult::ok("mongodb", vec![IngestedItem::rows(rows)])
                .with_metadata("collection", Value::String(spec.collection))
                .with_metadata("row_count", Value::from(count)),
        )
    }

    async fn close(&mut self) -> Result<()> {
        // The client cache owns the handle until close_all().
        self.client = None;
        Ok(())
    }

    async fn health_check(&mut self) -> Result<bool> {
        let client = self.client.as_ref().ok_or(OmnitapError::NotConnected)?;
        Ok(client
            .database("admin")
            .run_command(doc! {"ping": 1})
            .await
            .is_ok())
    }
}

fn document_to_row(document: Document) -> Row {
    document
        .into_iter()
        .map(|(key, value)| (key, bson_to_json(value)))
        .collect()
}

/// BSON → JSON with columnar-safe encodings for driver-native types.
fn bson_to_json(bson: Bson) -> Value {
    use base64::Engine as _;
    match bson {
        Bson::ObjectId(oid) => Value::String(oid.to_hex()),
        Bson::String(s) => Value::String(s),
        Bson::Boolean(b) => Value::Bool(b),
        Bson::Int32(n) => Value::Number(n.into()),
        Bson::Int64(n) => Value::Number(n.into()),
        Bson::Double(f) => Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
        Bson::Null | Bson::Undefined => Value::Null,
        Bson::DateTime(dt) => dt
            .try_to_rfc3339_string()
            .map(Value::String)
            .unwrap_or(Value::Null),
        Bson::Binary(binary) => Value::String(
            base64::engine::general_purpose::STANDARD.encode(&binary.bytes),
        ),
        Bson::Decimal128(d) => Value::String(d.to_string()),
        Bson::Document(document) => Value::Object(
            document
                .into_iter()
                .map(|(k, v)| (k, bson_to_json(v)))
                .collect(),
        ),
        Bson::Array(items) => Value::Array(items.into_iter().map(bson_to_json).collect()),
        other => Value::String(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mongodb::bson::oid::ObjectId;
    use serde_json::json;

    #[test]
    fn test_requires_database_and_address() {
        let err = MongoConnector::from_config(ConfigMap::new()).unwrap_err();
        assert!(err.to_string().contains("missing required keys: [database]"));

        let mut config = ConfigMap::new();
        config.insert("database".to_string(), json!("app"));
        let err = MongoConnector::from_config(config).unwrap_err();
        assert!(err.to_string().contains("[uri]"));
    }

    #[tokio::test]
    async fn test_fetch_before_connect() {
        let mut config = ConfigMap::new();
        config.insert("database".to_string(), json!("app"));
        config.insert("host".to_string(), json!("localhost"));
        let mut conn = MongoConnector::from_config(config).unwrap();
        let err = conn.fetch("users").await.unwrap_err();
        assert_eq!(err.to_string(), "not connected");
    }

    #[test]
    fn test_object_id_stringified() {
        let oid = ObjectId::new();
        let mut document = Document::new();
        document.insert("_id", oid);
        document.insert("n", 7i64);

        let row = document_to_row(document);
        assert_eq!(row["_id"], json!(oid.to_hex()));
        assert_eq!(row["n"], json!(7));
    }

    #[test]
    fn test_nested_and_binary_values() {
        let mut document = Document::new();
        document.insert(
            "bin",
            Bson::Binary(mongodb::bson::Binary {
                subtype: mongodb::bson::spec::BinarySubtype::Generic,
                bytes: vec![1, 2, 3],
            }),
        );
        document.insert("tags", vec!["a", "b"]);

        let row = document_to_row(document);
        assert_eq!(row["bin"], json!("AQID"));
        assert_eq!(row["tags"], json!(["a", "b"]));
    }
}
