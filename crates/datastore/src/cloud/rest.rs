//! Google Cloud Datastore v1 over REST.
//!
//! Entity documents map onto Datastore properties: integers travel as
//! `integerValue` strings, RFC 3339 strings as `timestampValue`, nested
//! objects as entity values, and the raw-bytes property as an unindexed
//! `blobValue`.

use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Map, Value as Json};
use tracing::{debug, info};

use super::auth::{Credentials, TokenSource};
use super::client::{CloudClient, Document, Mutation, TransactionId, RAW_PROPERTY};
use super::query::{CloudQuery, Direction};
use crate::error::{StoreError, StoreResult};
use crate::key::Key;
use crate::value::{Operator, Value};

/// Datastore refuses to index strings longer than this.
const MAX_INDEXED_STRING: usize = 1500;

pub struct RestClient {
    http: reqwest::Client,
    /// `<endpoint>/v1/projects/<project>`.
    base: String,
    project: String,
    database: String,
    tokens: TokenSource,
}

/// Splits `project[/database]`.
pub fn parse_store_id(id: &str) -> StoreResult<(&str, &str)> {
    let parts: Vec<&str> = id.split('/').collect();
    match parts.as_slice() {
        [project] if !project.is_empty() => Ok((*project, "")),
        [project, database] if !project.is_empty() => Ok((*project, *database)),
        _ => Err(StoreError::InvalidStoreId(id.to_string())),
    }
}

impl RestClient {
    /// Connects to the project named by `id`, authenticating with the
    /// credentials found at `location`. When an emulator host is configured
    /// (or `DATASTORE_EMULATOR_HOST` is set) requests go there
    /// unauthenticated.
    pub async fn connect(
        id: &str,
        location: &str,
        cfg: &configs::CloudConfig,
    ) -> StoreResult<Self> {
        let (project, database) = parse_store_id(id)?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .build()
            .map_err(StoreError::transport)?;

        let emulator = cfg
            .emulator_host
            .clone()
            .or_else(|| std::env::var("DATASTORE_EMULATOR_HOST").ok())
            .filter(|h| !h.is_empty());
        let (endpoint, credentials) = match emulator {
            Some(host) => (format!("http://{host}"), Credentials::Anonymous),
            None => (cfg.endpoint.clone(), Credentials::resolve(project, location, &http).await?),
        };

        info!(%project, %database, %endpoint, "cloud datastore client ready");
        Ok(Self::with_credentials(http, &endpoint, project, database, credentials))
    }

    pub fn with_credentials(
        http: reqwest::Client,
        endpoint: &str,
        project: &str,
        database: &str,
        credentials: Credentials,
    ) -> Self {
        Self {
            base: format!("{}/v1/projects/{project}", endpoint.trim_end_matches('/')),
            project: project.to_string(),
            database: database.to_string(),
            tokens: TokenSource::new(http.clone(), credentials),
            http,
        }
    }

    fn partition(&self) -> Json {
        let mut p = json!({ "projectId": self.project });
        if !self.database.is_empty() {
            p["databaseId"] = json!(self.database);
        }
        p
    }

    /// Request body with the database id filled in.
    fn body(&self, mut body: Json) -> Json {
        if !self.database.is_empty() {
            body["databaseId"] = json!(self.database);
        }
        body
    }

    fn key_json(&self, key: &Key) -> Json {
        let element = if key.id != 0 {
            json!({ "kind": key.kind, "id": key.id.to_string() })
        } else if !key.name.is_empty() {
            json!({ "kind": key.kind, "name": key.name })
        } else {
            json!({ "kind": key.kind })
        };
        json!({ "partitionId": self.partition(), "path": [element] })
    }

    fn entity_json(&self, key: &Key, doc: &Document) -> Json {
        let properties: Map<String, Json> = doc
            .iter()
            .map(|(name, value)| (name.clone(), property_json(name, value)))
            .collect();
        json!({ "key": self.key_json(key), "properties": properties })
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, body: Json) -> StoreResult<T> {
        let url = format!("{}:{method}", self.base);
        let mut req = self.http.post(&url).json(&self.body(body));
        if let Some(token) = self.tokens.token().await? {
            req = req.bearer_auth(token);
        }
        let resp = req.send().await.map_err(StoreError::transport)?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(api_error(status.as_u16(), &text));
        }
        resp.json::<T>().await.map_err(StoreError::decoding)
    }
}

#[derive(Deserialize)]
struct ApiErrorBody {
    error: ApiError,
}

#[derive(Deserialize)]
struct ApiError {
    #[serde(default)]
    message: String,
    #[serde(default)]
    status: String,
}

fn api_error(code: u16, body: &str) -> StoreError {
    let err = serde_json::from_str::<ApiErrorBody>(body).map(|b| b.error).unwrap_or(ApiError {
        message: body.to_string(),
        status: String::new(),
    });
    match err.status.as_str() {
        "ABORTED" => StoreError::TransactionConflict,
        "ALREADY_EXISTS" => StoreError::EntityExists,
        _ => StoreError::transport(format!("datastore returned {code}: {}", err.message)),
    }
}

fn property_json(name: &str, value: &Json) -> Json {
    if name == RAW_PROPERTY {
        if let Json::String(b64) = value {
            return json!({ "blobValue": b64, "excludeFromIndexes": true });
        }
    }
    value_json(value)
}

fn value_json(value: &Json) -> Json {
    match value {
        Json::Null => json!({ "nullValue": null }),
        Json::Bool(b) => json!({ "booleanValue": b }),
        Json::Number(n) => match n.as_i64() {
            Some(i) => json!({ "integerValue": i.to_string() }),
            None => json!({ "doubleValue": n.as_f64() }),
        },
        Json::String(s) if DateTime::parse_from_rfc3339(s).is_ok() => {
            json!({ "timestampValue": s })
        }
        Json::String(s) if s.len() > MAX_INDEXED_STRING => {
            json!({ "stringValue": s, "excludeFromIndexes": true })
        }
        Json::String(s) => json!({ "stringValue": s }),
        Json::Array(items) => {
            let values: Vec<Json> = items.iter().map(value_json).collect();
            json!({ "arrayValue": { "values": values } })
        }
        Json::Object(fields) => {
            let properties: Map<String, Json> = fields
                .iter()
                .map(|(k, v)| (k.clone(), value_json(v)))
                .collect();
            json!({ "entityValue": { "properties": properties } })
        }
    }
}

/// Time-like strings are stored as timestamps, so they are matched as
/// timestamps too.
fn filter_value_json(value: &Value) -> Json {
    match value {
        Value::Null => json!({ "nullValue": null }),
        Value::Bool(b) => json!({ "booleanValue": b }),
        Value::Int(i) => json!({ "integerValue": i.to_string() }),
        Value::UInt(u) => json!({ "integerValue": u.to_string() }),
        Value::Float(f) => json!({ "doubleValue": f }),
        Value::Str(s) if DateTime::parse_from_rfc3339(s).is_ok() => {
            json!({ "timestampValue": s })
        }
        Value::Str(s) => json!({ "stringValue": s }),
        Value::Time(t) => json!({ "timestampValue": t.to_rfc3339() }),
    }
}

fn from_value_json(value: &Json) -> Json {
    let Some(obj) = value.as_object() else {
        return Json::Null;
    };
    if let Some(s) = obj.get("integerValue").and_then(Json::as_str) {
        return s.parse::<i64>().map(Json::from).unwrap_or(Json::Null);
    }
    if let Some(v) = obj.get("doubleValue") {
        return v.clone();
    }
    for field in ["booleanValue", "stringValue", "timestampValue", "blobValue"] {
        if let Some(v) = obj.get(field) {
            return v.clone();
        }
    }
    let values = obj
        .get("arrayValue")
        .and_then(|a| a.get("values"))
        .and_then(Json::as_array);
    if let Some(values) = values {
        return Json::Array(values.iter().map(from_value_json).collect());
    }
    let props = obj
        .get("entityValue")
        .and_then(|e| e.get("properties"))
        .and_then(Json::as_object);
    if let Some(props) = props {
        let fields = props
            .iter()
            .map(|(k, v)| (k.clone(), from_value_json(v)))
            .collect();
        return Json::Object(fields);
    }
    Json::Null
}

#[derive(Deserialize)]
struct EntityJson {
    key: KeyJson,
    #[serde(default)]
    properties: Map<String, Json>,
}

impl EntityJson {
    fn document(&self) -> Document {
        self.properties.iter().map(|(k, v)| (k.clone(), from_value_json(v))).collect()
    }
}

#[derive(Deserialize)]
struct KeyJson {
    path: Vec<PathElement>,
}

#[derive(Deserialize)]
struct PathElement {
    kind: String,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

impl KeyJson {
    fn to_key(&self) -> StoreResult<Key> {
        let last = self.path.last().ok_or_else(|| StoreError::decoding("empty key path"))?;
        match (&last.id, &last.name) {
            (Some(id), _) => {
                let id = id.parse::<i64>().map_err(StoreError::decoding)?;
                Ok(Key::with_id(last.kind.clone(), id))
            }
            (None, Some(name)) => Ok(Key::with_name(last.kind.clone(), name.clone())),
            (None, None) => Ok(Key::incomplete(last.kind.clone())),
        }
    }
}

#[derive(Deserialize)]
struct EntityResult {
    entity: EntityJson,
}

#[derive(Deserialize)]
struct LookupResponse {
    #[serde(default)]
    found: Vec<EntityResult>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RunQueryResponse {
    batch: QueryBatch,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryBatch {
    #[serde(default)]
    entity_results: Vec<EntityResult>,
    #[serde(default)]
    end_cursor: Option<String>,
    #[serde(default)]
    more_results: String,
    #[serde(default)]
    skipped_results: usize,
}

#[derive(Deserialize)]
struct BeginTransactionResponse {
    transaction: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommitResponse {
    #[serde(default)]
    mutation_results: Vec<MutationResult>,
}

#[derive(Deserialize)]
struct MutationResult {
    #[serde(default)]
    key: Option<KeyJson>,
}

fn operator_name(op: Operator) -> &'static str {
    match op {
        Operator::Eq => "EQUAL",
        Operator::Lt => "LESS_THAN",
        Operator::Gt => "GREATER_THAN",
        Operator::Le => "LESS_THAN_OR_EQUAL",
        Operator::Ge => "GREATER_THAN_OR_EQUAL",
    }
}

/// The `query` object of a runQuery request, without cursor or paging.
fn query_json(query: &CloudQuery) -> Json {
    let mut q = json!({ "kind": [{ "name": query.kind() }] });

    let filters: Vec<Json> = query
        .filters()
        .iter()
        .map(|f| {
            json!({ "propertyFilter": {
                "property": { "name": f.field },
                "op": operator_name(f.operator),
                "value": filter_value_json(&f.value),
            }})
        })
        .collect();
    match filters.len() {
        0 => {}
        1 => q["filter"] = filters[0].clone(),
        _ => q["filter"] = json!({ "compositeFilter": { "op": "AND", "filters": filters } }),
    }

    if !query.orders().is_empty() {
        let orders: Vec<Json> = query
            .orders()
            .iter()
            .map(|(field, dir)| {
                let direction = match dir {
                    Direction::Ascending => "ASCENDING",
                    Direction::Descending => "DESCENDING",
                };
                json!({ "property": { "name": field }, "direction": direction })
            })
            .collect();
        q["order"] = Json::Array(orders);
    }

    if query.keys_only() {
        q["projection"] = json!([{ "property": { "name": "__key__" } }]);
    }
    q
}

#[async_trait]
impl CloudClient for RestClient {
    async fn lookup(&self, key: &Key, tx: Option<&TransactionId>) -> StoreResult<Option<Document>> {
        let mut body = json!({ "keys": [self.key_json(key)] });
        if let Some(tx) = tx {
            body["readOptions"] = json!({ "transaction": tx.0 });
        }
        let resp: LookupResponse = self.call("lookup", body).await?;
        Ok(resp.found.first().map(|r| r.entity.document()))
    }

    /// Pages through the results with cursors until the batch reports no
    /// more, carrying over any offset the server has not yet skipped.
    async fn run_query(&self, query: &CloudQuery) -> StoreResult<Vec<(Key, Option<Document>)>> {
        let base = query_json(query);
        let mut offset = query.offset_value();
        let mut remaining = query.limit_value();
        let mut cursor: Option<String> = None;
        let mut results = Vec::new();

        loop {
            if remaining == Some(0) {
                break;
            }
            let mut q = base.clone();
            if offset > 0 {
                q["offset"] = json!(offset);
            }
            if let Some(limit) = remaining {
                q["limit"] = json!(limit);
            }
            if let Some(c) = &cursor {
                q["startCursor"] = json!(c);
            }

            let body = json!({ "partitionId": self.partition(), "query": q });
            let resp: RunQueryResponse = self.call("runQuery", body).await?;
            let batch = resp.batch;
            offset = offset.saturating_sub(batch.skipped_results);
            let fetched = batch.entity_results.len();
            for r in batch.entity_results {
                let key = r.entity.key.to_key()?;
                let doc = (!query.keys_only()).then(|| r.entity.document());
                results.push((key, doc));
            }
            remaining = remaining.map(|n| n.saturating_sub(fetched));

            if batch.more_results != "NOT_FINISHED" || batch.end_cursor.is_none() {
                break;
            }
            cursor = batch.end_cursor;
        }
        debug!(kind = %query.kind(), results = results.len(), "runQuery done");
        Ok(results)
    }

    async fn begin_transaction(&self) -> StoreResult<TransactionId> {
        let resp: BeginTransactionResponse = self.call("beginTransaction", json!({})).await?;
        Ok(TransactionId(resp.transaction))
    }

    async fn commit(
        &self,
        tx: Option<&TransactionId>,
        mutations: Vec<Mutation>,
    ) -> StoreResult<Vec<Key>> {
        let wire: Vec<Json> = mutations
            .iter()
            .map(|m| match m {
                Mutation::Insert(key, doc) => json!({ "insert": self.entity_json(key, doc) }),
                Mutation::Upsert(key, doc) => json!({ "upsert": self.entity_json(key, doc) }),
                Mutation::Delete(key) => json!({ "delete": self.key_json(key) }),
            })
            .collect();
        let body = match tx {
            Some(tx) => json!({ "mode": "TRANSACTIONAL", "transaction": tx.0, "mutations": wire }),
            None => json!({ "mode": "NON_TRANSACTIONAL", "mutations": wire }),
        };
        let resp: CommitResponse = self.call("commit", body).await?;

        // Results carry a key only when one was allocated.
        let mut keys = Vec::with_capacity(mutations.len());
        for (i, m) in mutations.iter().enumerate() {
            let allocated = resp.mutation_results.get(i).and_then(|r| r.key.as_ref());
            match allocated {
                Some(k) => keys.push(k.to_key()?),
                None => keys.push(m.key().clone()),
            }
        }
        Ok(keys)
    }

    async fn rollback(&self, tx: &TransactionId) -> StoreResult<()> {
        let _: Json = self.call("rollback", json!({ "transaction": tx.0 })).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::Query;

    fn client(database: &str) -> RestClient {
        RestClient::with_credentials(
            reqwest::Client::new(),
            "http://localhost:8081/",
            "openfish",
            database,
            Credentials::Anonymous,
        )
    }

    #[test]
    fn store_ids_name_project_and_database() {
        assert_eq!(parse_store_id("openfish").unwrap(), ("openfish", ""));
        assert_eq!(parse_store_id("openfish/staging").unwrap(), ("openfish", "staging"));
        assert!(matches!(parse_store_id("a/b/c"), Err(StoreError::InvalidStoreId(_))));
        assert!(matches!(parse_store_id(""), Err(StoreError::InvalidStoreId(_))));
    }

    #[test]
    fn keys_use_ids_then_names() {
        let c = client("staging");
        assert_eq!(c.base, "http://localhost:8081/v1/projects/openfish");
        let k = c.key_json(&Key::with_id("Device", 42));
        assert_eq!(k["path"][0]["id"], "42");
        assert_eq!(k["partitionId"]["databaseId"], "staging");
        let k = c.key_json(&Key::with_name("User", "a@b"));
        assert_eq!(k["path"][0]["name"], "a@b");
        let k = client("").key_json(&Key::incomplete("Note"));
        assert!(k["path"][0].get("id").is_none());
        assert!(k["partitionId"].get("databaseId").is_none());
    }

    #[test]
    fn properties_round_trip_through_wire_values() {
        let doc: Document = serde_json::from_value(json!({
            "Name": "reef",
            "Depth": 12,
            "Ratio": 0.5,
            "When": "2024-05-01T10:00:00Z",
            "Tags": ["a", "b"],
            "Meta": { "On": true }
        }))
        .unwrap();
        let wire = client("").entity_json(&Key::with_name("Dive", "x"), &doc);
        assert_eq!(wire["properties"]["Depth"]["integerValue"], "12");
        assert_eq!(wire["properties"]["When"]["timestampValue"], "2024-05-01T10:00:00Z");

        let back: Document = wire["properties"]
            .as_object()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), from_value_json(v)))
            .collect();
        assert_eq!(back, doc);
    }

    #[test]
    fn raw_bytes_are_unindexed_blobs() {
        let wire = property_json(RAW_PROPERTY, &json!("AAEC"));
        assert_eq!(wire, json!({ "blobValue": "AAEC", "excludeFromIndexes": true }));
    }

    #[test]
    fn queries_compose_filters_orders_and_projection() {
        let mut q = CloudQuery::new("Dive", true);
        q.filter("Depth >", Value::Int(5)).unwrap();
        let wire = query_json(&q);
        assert_eq!(wire["filter"]["propertyFilter"]["op"], "GREATER_THAN");
        assert_eq!(wire["projection"][0]["property"]["name"], "__key__");

        q.filter_field("Site", "=", "bay".into()).unwrap();
        q.order("-Depth");
        let wire = query_json(&q);
        assert_eq!(wire["filter"]["compositeFilter"]["filters"].as_array().unwrap().len(), 2);
        assert_eq!(wire["order"][0]["direction"], "DESCENDING");
    }

    #[test]
    fn time_like_string_filters_match_stored_timestamps() {
        let stamp = "2024-05-01T10:00:00Z";
        assert_eq!(value_json(&json!(stamp)), json!({ "timestampValue": stamp }));
        assert_eq!(filter_value_json(&Value::from(stamp)), json!({ "timestampValue": stamp }));
        assert_eq!(filter_value_json(&Value::from("plain")), json!({ "stringValue": "plain" }));
    }

    #[test]
    fn api_errors_map_to_store_errors() {
        let aborted =
            r#"{"error":{"code":409,"message":"too much contention","status":"ABORTED"}}"#;
        assert!(matches!(api_error(409, aborted), StoreError::TransactionConflict));
        let exists =
            r#"{"error":{"code":409,"message":"entity exists","status":"ALREADY_EXISTS"}}"#;
        assert!(matches!(api_error(409, exists), StoreError::EntityExists));
        assert!(matches!(api_error(502, "bad gateway"), StoreError::Transport(_)));
    }
}
