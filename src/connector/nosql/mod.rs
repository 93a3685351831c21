//! NoSQL connectors (MongoDB, Cassandra, Neo4j).
//!
//! Each exposes a native driver handle and dispatches the fetch query in the
//! store's own language. Driver-native identifiers that do not serialize
//! (object ids, binaries, UUIDs) are stringified so the staged Parquet
//! columns round-trip.

pub mod cassandra;
pub mod mongo;
pub mod neo4j;
