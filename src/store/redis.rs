use async_trait::async_trait;
use futures::StreamExt;
use log::{ debug, error, warn };
use redis::aio::MultiplexedConnection;
use redis::{ AsyncCommands, Client, Script };
use serde_json::{ json, Map, Value };
use tokio::sync::mpsc;
use uuid::Uuid;

use super::{
    document_path,
    split_document_path,
    validate_collection_path,
    Document,
    DocumentSnapshot,
    DocumentStore,
    FieldValue,
    Fields,
    Query,
    Snapshot,
    Subscription,
    SNAPSHOT_BUFFER,
};
use crate::error::StoreError;

/// Applies an encoded write atomically: resolves the server time against a
/// per-store clock, merges or replaces the document, indexes it under its
/// collection and publishes the change.
///
/// KEYS: document, collection index, clock. ARGV: ops, merge flag, id, channel.
const WRITE_SCRIPT: &str = r#"
local function apply(target, ops, ts)
  for name, op in pairs(ops) do
    if op['set'] ~= nil then
      target[name] = op['set']
    elseif op['ts'] ~= nil then
      target[name] = ts
    elseif op['inc'] ~= nil then
      local current = target[name]
      if type(current) ~= 'number' then current = 0 end
      target[name] = current + op['inc']
    elseif op['map'] ~= nil then
      local child = target[name]
      if type(child) ~= 'table' then child = {} end
      target[name] = apply(child, op['map'], ts)
    end
  end
  return target
end

local clock = redis.call('TIME')
local ts = tonumber(clock[1]) * 1000 + math.floor(tonumber(clock[2]) / 1000)
local last = tonumber(redis.call('GET', KEYS[3]) or '0')
if ts <= last then ts = last + 1 end
redis.call('SET', KEYS[3], ts)

local doc = {}
if ARGV[2] == '1' then
  local raw = redis.call('GET', KEYS[1])
  if raw then doc = cjson.decode(raw) end
end
doc = apply(doc, cjson.decode(ARGV[1]), ts)
redis.call('SET', KEYS[1], cjson.encode(doc))
redis.call('SADD', KEYS[2], ARGV[3])
redis.call('PUBLISH', ARGV[4], ARGV[3])
return ts
"#;

/// Encodes a write for `WRITE_SCRIPT`.
fn encode_ops(fields: &Fields) -> Value {
    let ops: Map<String, Value> = fields
        .iter()
        .map(|(name, field)| {
            let op = match field {
                FieldValue::Set(value) => json!({ "set": value }),
                FieldValue::ServerTimestamp => json!({ "ts": true }),
                FieldValue::Increment(by) => json!({ "inc": by }),
                FieldValue::Map(nested) => json!({ "map": encode_ops(nested) }),
            };
            (name.clone(), op)
        })
        .collect();
    Value::Object(ops)
}

#[derive(Clone)]
struct KeySpace {
    prefix: String,
}

impl KeySpace {
    fn document(&self, path: &str) -> String {
        format!("{}doc:{}", self.prefix, path)
    }

    fn index(&self, collection: &str) -> String {
        format!("{}idx:{}", self.prefix, collection)
    }

    fn channel(&self, collection: &str) -> String {
        format!("{}changes:{}", self.prefix, collection)
    }

    fn clock(&self) -> String {
        format!("{}clock", self.prefix)
    }
}

/// Documents are JSON strings under `{prefix}doc:{path}`; each collection keeps
/// a set of member keys and a pub/sub channel that carries change events.
pub struct RedisDocumentStore {
    client: Client,
    keys: KeySpace,
    write_script: Script,
}

impl RedisDocumentStore {
    pub fn new(host: &str, prefix: &str) -> Result<Self, StoreError> {
        Ok(Self {
            client: Client::open(host)?,
            keys: KeySpace { prefix: prefix.to_string() },
            write_script: Script::new(WRITE_SCRIPT),
        })
    }

    async fn get_connection(&self) -> Result<MultiplexedConnection, redis::RedisError> {
        self.client.get_multiplexed_async_connection().await
    }

    async fn write(
        &self,
        path: &str,
        collection: &str,
        id: &str,
        fields: &Fields,
        merge: bool
    ) -> Result<(), StoreError> {
        let mut conn = self.get_connection().await?;
        let ops = serde_json::to_string(&encode_ops(fields))?;
        let server_time: i64 = self.write_script
            .key(self.keys.document(path))
            .key(self.keys.index(collection))
            .key(self.keys.clock())
            .arg(ops)
            .arg(if merge { "1" } else { "0" })
            .arg(id)
            .arg(self.keys.channel(collection))
            .invoke_async(&mut conn).await?;
        debug!("Wrote {} at {} (merge: {})", path, server_time, merge);
        Ok(())
    }
}

fn parse_document(path: &str, raw: &str) -> Result<Document, StoreError> {
    match serde_json::from_str::<Value>(raw)? {
        Value::Object(map) => Ok(map),
        other =>
            Err(StoreError::InvalidDocument {
                path: path.to_string(),
                reason: format!("expected an object, found {}", other),
            }),
    }
}

async fn fetch_snapshot(
    conn: &mut MultiplexedConnection,
    keys: &KeySpace,
    query: &Query
) -> Result<Snapshot, StoreError> {
    let ids: Vec<String> = conn.smembers(keys.index(&query.collection)).await?;
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let doc_keys: Vec<String> = ids
        .iter()
        .map(|id| keys.document(&document_path(&query.collection, id)))
        .collect();
    let raws: Vec<Option<String>> = redis::cmd("MGET").arg(&doc_keys).query_async(conn).await?;

    let mut members = Vec::with_capacity(ids.len());
    for (id, raw) in ids.into_iter().zip(raws) {
        let Some(raw) = raw else {
            continue;
        };
        let path = document_path(&query.collection, &id);
        match parse_document(&path, &raw) {
            Ok(data) => members.push(DocumentSnapshot { id, data }),
            Err(e) => error!("Skipping unreadable document {}: {}", path, e),
        }
    }
    Ok(query.evaluate(members))
}

#[async_trait]
impl DocumentStore for RedisDocumentStore {
    async fn get_document(&self, path: &str) -> Result<Option<Document>, StoreError> {
        split_document_path(path)?;
        let mut conn = self.get_connection().await?;
        let raw: Option<String> = conn.get(self.keys.document(path)).await?;
        raw.map(|raw| parse_document(path, &raw)).transpose()
    }

    async fn set_document(
        &self,
        path: &str,
        fields: &Fields,
        merge: bool
    ) -> Result<(), StoreError> {
        let (collection, id) = split_document_path(path)?;
        self.write(path, collection, id, fields, merge).await
    }

    async fn append_document(
        &self,
        collection_path: &str,
        fields: &Fields
    ) -> Result<String, StoreError> {
        validate_collection_path(collection_path)?;
        let id = Uuid::new_v4().to_string();
        let path = document_path(collection_path, &id);
        self.write(&path, collection_path, &id, fields, false).await?;
        Ok(id)
    }

    async fn subscribe_ordered_query(&self, query: Query) -> Result<Subscription, StoreError> {
        validate_collection_path(&query.collection)?;

        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(self.keys.channel(&query.collection)).await?;
        let mut conn = self.get_connection().await?;
        let keys = self.keys.clone();
        let (tx, rx) = mpsc::channel(SNAPSHOT_BUFFER);
        let label = query.collection.clone();

        let task = tokio::spawn(async move {
            match fetch_snapshot(&mut conn, &keys, &query).await {
                Ok(snapshot) => {
                    if tx.send(snapshot).await.is_err() {
                        return;
                    }
                }
                Err(e) => error!("Initial query on {} failed: {}", query.collection, e),
            }

            let mut events = Box::pin(pubsub.into_on_message());
            while events.next().await.is_some() {
                match fetch_snapshot(&mut conn, &keys, &query).await {
                    Ok(snapshot) => {
                        if tx.send(snapshot).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("Refreshing {} failed: {}", query.collection, e),
                }
            }
            debug!("Change feed for {} closed", query.collection);
        });

        Ok(Subscription::new(label, rx, task))
    }
}
