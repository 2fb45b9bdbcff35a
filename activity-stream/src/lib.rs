// Library surface of the activity-stream binary: the incoming query
// gateway, the outgoing feed ingester, and the pieces they share.

pub mod auth;
pub mod elasticsearch;
pub mod feeds;
pub mod ingest;
pub mod kv;
pub mod lock;
pub mod metrics;
pub mod server;
pub mod signing;
