use airembr::store::FactQuery;
use airembr::{merge_observations, Observation};
use airembr_client::{ClientConfig, MemoryClient, RememberOptions, CONFIG_FILE};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::{json, Value as JsonValue};
use std::env;
use std::io::{self, BufRead, BufReader, Write};
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const MAX_MESSAGE_BYTES: usize = 1_048_576; // 1 MiB
const MAX_OBSERVATIONS: usize = 256;
const MAX_ID_BYTES: usize = 512;
const MAX_IDEMPOTENCY_KEY_BYTES: usize = 512;
const MAX_QUERY_LIMIT: usize = 200;
const DEFAULT_STORE_PATH: &str = "./airembr-mcp.airembr";

struct AppState {
    client: MemoryClient,
}

impl AppState {
    fn open() -> Result<Self> {
        let config_path = env::var("AIREMBR_CONFIG").unwrap_or_else(|_| CONFIG_FILE.to_string());
        let mut config = ClientConfig::load_from_path(&config_path)
            .with_context(|| format!("failed to load configuration from {config_path}"))?;
        if config.store_path.is_none() {
            config.store_path = Some(PathBuf::from(DEFAULT_STORE_PATH));
        }
        let client = MemoryClient::from_config(&config)?;
        Ok(Self { client })
    }
}

fn main() -> Result<()> {
    // stdout carries the protocol; logs go to stderr.
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    let state = AppState::open().context("failed to open airembr memory store")?;
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "airembr-mcp ready");

    let stdin = io::stdin();
    let mut reader = BufReader::new(stdin.lock());
    let stdout = io::stdout();
    let mut writer = stdout.lock();

    loop {
        let maybe = match read_message(&mut reader) {
            Ok(m) => m,
            Err(e) => {
                // Bad framing answers -32700 and the loop keeps reading.
                tracing::warn!(error = %e, "unreadable message");
                let err_resp = json!({
                    "jsonrpc": "2.0",
                    "id": null,
                    "error": { "code": -32700, "message": format!("Parse error: {e}") }
                });
                write_message(&mut writer, &err_resp)?;
                continue;
            }
        };
        let Some(request) = maybe else {
            break;
        };
        if let Some(response) = handle_request(&state, &request) {
            write_message(&mut writer, &response)?;
        }
    }

    tracing::info!("stdin closed, shutting down");
    Ok(())
}

fn read_message<R: BufRead>(reader: &mut R) -> Result<Option<JsonValue>> {
    let mut content_length: Option<usize> = None;

    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line)?;
        if n == 0 {
            return Ok(None);
        }

        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            break;
        }

        if let Some((name, value)) = trimmed.split_once(':') {
            if name.eq_ignore_ascii_case("Content-Length") {
                content_length = Some(
                    value
                        .trim()
                        .parse::<usize>()
                        .context("invalid Content-Length")?,
                );
            }
        }
    }

    let len = content_length.context("missing Content-Length header")?;
    if len > MAX_MESSAGE_BYTES {
        anyhow::bail!(
            "Content-Length {} exceeds max allowed {} bytes",
            len,
            MAX_MESSAGE_BYTES
        );
    }
    let mut payload = vec![0_u8; len];
    reader.read_exact(&mut payload)?;
    let value: JsonValue = serde_json::from_slice(&payload).context("invalid JSON payload")?;
    Ok(Some(value))
}

fn write_message<W: Write>(writer: &mut W, value: &JsonValue) -> Result<()> {
    let payload = serde_json::to_vec(value)?;
    write!(writer, "Content-Length: {}\r\n\r\n", payload.len())?;
    writer.write_all(&payload)?;
    writer.flush()?;
    Ok(())
}

fn handle_request(state: &AppState, req: &JsonValue) -> Option<JsonValue> {
    let id = req.get("id").cloned();
    let method = req.get("method").and_then(JsonValue::as_str)?;

    match method {
        "initialize" => id.map(|id_val| {
            json!({
                "jsonrpc": "2.0",
                "id": id_val,
                "result": {
                    "protocolVersion": "2024-11-05",
                    "capabilities": { "tools": {} },
                    "serverInfo": { "name": "airembr-mcp", "version": env!("CARGO_PKG_VERSION") }
                }
            })
        }),
        "notifications/initialized" => None,
        "tools/list" => id.map(|id_val| {
            json!({
                "jsonrpc": "2.0",
                "id": id_val,
                "result": {
                    "tools": tools_schema()
                }
            })
        }),
        "tools/call" => id.map(|id_val| match call_tool(state, req.get("params")) {
            Ok(tool_result) => json!({
                "jsonrpc": "2.0",
                "id": id_val,
                "result": tool_result
            }),
            Err(err) => {
                tracing::debug!(error = %err, "tool call failed");
                json!({
                    "jsonrpc": "2.0",
                    "id": id_val,
                    "result": {
                        "content": [{ "type": "text", "text": format!("tool error: {err:#}") }],
                        "isError": true
                    }
                })
            }
        }),
        "ping" => id.map(|id_val| json!({ "jsonrpc": "2.0", "id": id_val, "result": {} })),
        _ => id.map(|id_val| {
            json!({
                "jsonrpc": "2.0",
                "id": id_val,
                "error": {
                    "code": -32601,
                    "message": format!("method not found: {method}")
                }
            })
        }),
    }
}

fn fact_query_schema() -> JsonValue {
    json!({
        "type": "object",
        "properties": {
            "where": {
                "description": "Dot-path filters over flat records, e.g. {\"rel.label\": \"purchased\"}.",
                "type": "object"
            },
            "min_date": {"type": "string", "format": "date-time"},
            "max_date": {"type": "string", "format": "date-time"},
            "page": {"type": "integer", "minimum": 0},
            "limit": {"type": "integer", "minimum": 1, "maximum": MAX_QUERY_LIMIT}
        }
    })
}

fn tools_schema() -> Vec<JsonValue> {
    vec![
        json!({
            "name": "remember",
            "description": "Validate observations and store them as flat fact records.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "observations": {"type": "array", "items": {"type": "object"}, "maxItems": MAX_OBSERVATIONS},
                    "idempotency_key": {"type": "string"}
                },
                "required": ["observations"]
            }
        }),
        json!({
            "name": "query_facts",
            "description": "Page through stored fact records matching dot-path filters and a date range.",
            "inputSchema": fact_query_schema()
        }),
        json!({
            "name": "query_entity",
            "description": "Return the fact records an entity takes part in, as actor or object.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "id": {"type": "string"},
                    "page": {"type": "integer", "minimum": 0}
                },
                "required": ["id"]
            }
        }),
        json!({
            "name": "merge_observations",
            "description": "Merge observations sharing (id, session) into one, oldest first. Nothing is stored.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "observations": {"type": "array", "items": {"type": "object"}, "maxItems": MAX_OBSERVATIONS}
                },
                "required": ["observations"]
            }
        }),
        json!({
            "name": "reconcile",
            "description": "Query stored fact records and merge them back into observations.",
            "inputSchema": fact_query_schema()
        }),
    ]
}

fn call_tool(state: &AppState, params: Option<&JsonValue>) -> Result<JsonValue> {
    let name = params
        .and_then(|v| v.get("name"))
        .and_then(JsonValue::as_str)
        .context("missing tool name")?;
    let args = params
        .and_then(|v| v.get("arguments"))
        .cloned()
        .unwrap_or_else(|| json!({}));

    match name {
        "remember" => {
            let observations = parse_observations(&args)?;
            let idempotency_key = args.get("idempotency_key").and_then(JsonValue::as_str);
            if let Some(key) = idempotency_key {
                if key.len() > MAX_IDEMPOTENCY_KEY_BYTES {
                    anyhow::bail!(
                        "idempotency_key exceeds max allowed size ({} bytes)",
                        MAX_IDEMPOTENCY_KEY_BYTES
                    );
                }
            }

            let options = RememberOptions {
                idempotency_key: idempotency_key.map(str::to_string),
                ..RememberOptions::default()
            };
            let sessions = state.client.observe(&observations, &options)?;
            let memory = sessions.format_all();
            Ok(json!({
                "content": [{
                    "type": "text",
                    "text": format!(
                        "Stored {} observation(s) across {} session(s)",
                        observations.len(),
                        sessions.len()
                    )
                }],
                "structuredContent": {
                    "observations": observations.len(),
                    "sessions": sessions,
                    "memory": memory
                }
            }))
        }
        "query_facts" => {
            let query = parse_fact_query(&args, state.client.config().page_limit)?;
            let page = state.client.query().facts(&query)?;
            Ok(json!({
                "content": [{
                    "type": "text",
                    "text": format!(
                        "Found {} record(s), showing {}",
                        page.total,
                        page.records.len()
                    )
                }],
                "structuredContent": page
            }))
        }
        "query_entity" => {
            let id = args
                .get("id")
                .and_then(JsonValue::as_str)
                .context("id is required")?;
            if id.len() > MAX_ID_BYTES {
                anyhow::bail!("id exceeds max allowed size ({} bytes)", MAX_ID_BYTES);
            }
            let page = optional_usize(&args, "page")?.unwrap_or(0);
            let result = state.client.query().entity(id, page)?;
            Ok(json!({
                "content": [{
                    "type": "text",
                    "text": format!("Entity {id} takes part in {} record(s)", result.total)
                }],
                "structuredContent": result
            }))
        }
        "merge_observations" => {
            let observations = parse_observations(&args)?;
            let merged = merge_observations(&observations);
            Ok(observations_result(merged))
        }
        "reconcile" => {
            let query = parse_fact_query(&args, state.client.config().page_limit)?;
            let merged = state.client.reconcile(&query)?;
            Ok(observations_result(merged))
        }
        _ => anyhow::bail!("unknown tool: {name}"),
    }
}

fn observations_result(observations: Vec<Observation>) -> JsonValue {
    let text = observations
        .iter()
        .map(|o| {
            let (id, session) = o.key();
            format!("{id} @ {session}: {}", o.describe_entities().join("; "))
        })
        .collect::<Vec<_>>()
        .join("\n");
    json!({
        "content": [{ "type": "text", "text": text }],
        "structuredContent": { "observations": observations }
    })
}

fn parse_observations(args: &JsonValue) -> Result<Vec<Observation>> {
    let items = args
        .get("observations")
        .and_then(JsonValue::as_array)
        .context("observations must be an array")?;
    if items.len() > MAX_OBSERVATIONS {
        anyhow::bail!(
            "too many observations ({} > {})",
            items.len(),
            MAX_OBSERVATIONS
        );
    }
    items
        .iter()
        .enumerate()
        .map(|(i, item)| {
            serde_json::from_value(item.clone()).with_context(|| format!("observation #{i}"))
        })
        .collect()
}

fn parse_fact_query(args: &JsonValue, default_limit: usize) -> Result<FactQuery> {
    let mut query = FactQuery::new().limit(default_limit);

    match args.get("where") {
        None | Some(JsonValue::Null) => {}
        Some(JsonValue::Object(filters)) => {
            for (path, value) in filters {
                query = query.filter(path.clone(), value.clone());
            }
        }
        Some(pairs @ JsonValue::Array(_)) => {
            query.filters = serde_json::from_value(pairs.clone())
                .context("where must be an object or a list of [path, value] pairs")?;
        }
        Some(_) => anyhow::bail!("where must be an object or a list of [path, value] pairs"),
    }
    if let Some(since) = optional_date(args, "min_date")? {
        query = query.since(since);
    }
    if let Some(until) = optional_date(args, "max_date")? {
        query = query.until(until);
    }
    if let Some(page) = optional_usize(args, "page")? {
        query = query.page(page);
    }
    if let Some(limit) = optional_usize(args, "limit")? {
        if limit == 0 || limit > MAX_QUERY_LIMIT {
            anyhow::bail!("limit must be between 1 and {}", MAX_QUERY_LIMIT);
        }
        query = query.limit(limit);
    }
    Ok(query)
}

fn optional_usize(args: &JsonValue, field: &str) -> Result<Option<usize>> {
    match args.get(field) {
        None | Some(JsonValue::Null) => Ok(None),
        Some(v) => {
            let n = v
                .as_u64()
                .with_context(|| format!("{field} must be a non-negative integer"))?;
            Ok(Some(usize::try_from(n).context("value out of range")?))
        }
    }
}

fn optional_date(args: &JsonValue, field: &str) -> Result<Option<DateTime<Utc>>> {
    match args.get(field) {
        None | Some(JsonValue::Null) => Ok(None),
        Some(v) => {
            let raw = v
                .as_str()
                .with_context(|| format!("{field} must be an RFC3339 string"))?;
            let parsed = DateTime::parse_from_rfc3339(raw)
                .with_context(|| format!("invalid {field}: {raw}"))?;
            Ok(Some(parsed.with_timezone(&Utc)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use airembr::store::ObservationStore;
    use airembr_client::LocalTransport;
    use std::io::Cursor;
    use tempfile::NamedTempFile;

    fn temp_state() -> (AppState, NamedTempFile) {
        let file = NamedTempFile::new().unwrap();
        let path = file.path().to_string_lossy().to_string();
        let store = ObservationStore::open(&path).unwrap();
        let client = MemoryClient::new(LocalTransport::new(store), ClientConfig::default());
        (AppState { client }, file)
    }

    fn purchase(age: u32, label: &str, at: &str) -> JsonValue {
        json!({
            "id": "obs-1",
            "observer": "person",
            "source": {"id": "web"},
            "session": {"id": "s-1"},
            "entities": {
                "person": {"instance": "person#ada", "traits": {"name": "Ada", "age": age}},
                "lamp": {"instance": "product#lamp"}
            },
            "relation": [{"label": label, "actor": "person", "objects": "lamp", "ts": at}]
        })
    }

    fn call(state: &AppState, name: &str, arguments: JsonValue) -> Result<JsonValue> {
        call_tool(state, Some(&json!({ "name": name, "arguments": arguments })))
    }

    #[test]
    fn remember_then_query_returns_records() {
        let (state, _file) = temp_state();
        let out = call(
            &state,
            "remember",
            json!({ "observations": [purchase(30, "purchased", "2024-01-01T10:00:00Z")] }),
        )
        .unwrap();
        assert_eq!(out["structuredContent"]["observations"], 1);
        assert!(out["structuredContent"]["sessions"]["s-1"].is_object());

        let facts = call(
            &state,
            "query_facts",
            json!({ "where": {"rel.label": "purchased"} }),
        )
        .unwrap();
        assert_eq!(facts["structuredContent"]["total"], 1);

        let none = call(
            &state,
            "query_facts",
            json!({ "where": [["rel.label", "returned"]] }),
        )
        .unwrap();
        assert_eq!(none["structuredContent"]["total"], 0);
    }

    #[test]
    fn query_entity_finds_objects() {
        let (state, _file) = temp_state();
        call(
            &state,
            "remember",
            json!({ "observations": [purchase(30, "purchased", "2024-01-01T10:00:00Z")] }),
        )
        .unwrap();
        let out = call(&state, "query_entity", json!({ "id": "lamp" })).unwrap();
        assert_eq!(out["structuredContent"]["total"], 1);
    }

    #[test]
    fn reconcile_merges_stored_observations() {
        let (state, _file) = temp_state();
        call(
            &state,
            "remember",
            json!({ "observations": [
                purchase(31, "purchased", "2024-01-02T10:00:00Z"),
                purchase(30, "visited", "2024-01-01T10:00:00Z")
            ] }),
        )
        .unwrap();

        let out = call(&state, "reconcile", json!({})).unwrap();
        let observations = out["structuredContent"]["observations"].as_array().unwrap();
        assert_eq!(observations.len(), 1);
        let labels: Vec<&str> = observations[0]["relation"]
            .as_array()
            .unwrap()
            .iter()
            .map(|r| r["label"].as_str().unwrap())
            .collect();
        assert_eq!(labels, vec!["visited", "purchased"]);
    }

    #[test]
    fn merge_observations_is_pure() {
        let (state, _file) = temp_state();
        let out = call(
            &state,
            "merge_observations",
            json!({ "observations": [
                purchase(31, "purchased", "2024-01-02T10:00:00Z"),
                purchase(30, "visited", "2024-01-01T10:00:00Z")
            ] }),
        )
        .unwrap();
        let merged = &out["structuredContent"]["observations"][0];
        assert_eq!(merged["entities"]["person"]["traits"]["age"], 31);

        let facts = call(&state, "query_facts", json!({})).unwrap();
        assert_eq!(facts["structuredContent"]["total"], 0);
    }

    #[test]
    fn remember_rejects_dangling_reference() {
        let (state, _file) = temp_state();
        let mut observation = purchase(30, "purchased", "2024-01-01T10:00:00Z");
        observation["relation"][0]["objects"] = json!("ghost");
        let err = call(&state, "remember", json!({ "observations": [observation] }))
            .expect_err("undeclared object must fail");
        assert!(format!("{err:#}").contains("ghost"));
    }

    #[test]
    fn remember_idempotent_stores_once() {
        let (state, _file) = temp_state();
        for _ in 0..2 {
            call(
                &state,
                "remember",
                json!({
                    "observations": [purchase(30, "purchased", "2024-01-01T10:00:00Z")],
                    "idempotency_key": "evt-1"
                }),
            )
            .unwrap();
        }
        let facts = call(&state, "query_facts", json!({})).unwrap();
        assert_eq!(facts["structuredContent"]["total"], 1);
    }

    #[test]
    fn read_message_rejects_oversized_frame() {
        let raw = format!("Content-Length: {}\r\n\r\n", MAX_MESSAGE_BYTES + 1);
        let mut cursor = Cursor::new(raw.into_bytes());
        let err = read_message(&mut cursor).expect_err("oversized frame must fail");
        assert!(err.to_string().contains("exceeds max allowed"));
    }

    #[test]
    fn query_rejects_excessive_limit() {
        let (state, _file) = temp_state();
        let err = call(
            &state,
            "query_facts",
            json!({ "limit": MAX_QUERY_LIMIT + 1 }),
        )
        .expect_err("excessive limit must fail");
        assert!(err.to_string().contains("limit must be between"));
    }

    #[test]
    fn query_rejects_bad_dates() {
        let (state, _file) = temp_state();
        assert!(call(&state, "reconcile", json!({ "min_date": "yesterday" })).is_err());
    }

    #[test]
    fn unknown_method_and_tool() {
        let (state, _file) = temp_state();
        let resp = handle_request(&state, &json!({"jsonrpc": "2.0", "id": 7, "method": "nope"}))
            .unwrap();
        assert_eq!(resp["error"]["code"], -32601);

        let resp = handle_request(
            &state,
            &json!({
                "jsonrpc": "2.0",
                "id": 8,
                "method": "tools/call",
                "params": {"name": "forget", "arguments": {}}
            }),
        )
        .unwrap();
        assert_eq!(resp["result"]["isError"], true);

        assert!(handle_request(
            &state,
            &json!({"jsonrpc": "2.0", "method": "notifications/initialized"})
        )
        .is_none());
    }
}
