//! AiRembr SDK client.
//!
//! Sends observations to a memory backend through a [`Transport`], queries
//! stored facts back, and reconciles them into merged observations.
//!
//! # Usage
//!
//! ```rust,no_run
//! use airembr::store::FactQuery;
//! use airembr_client::{ClientConfig, MemoryClient};
//!
//! let config = ClientConfig::load().unwrap();
//! let client = MemoryClient::from_config(&config).unwrap();
//!
//! // Everything known about purchases, merged per observation and session.
//! let merged = client
//!     .reconcile(&client.fact_query().filter("rel.label", "purchased"))
//!     .unwrap();
//! println!("{} observations", merged.len());
//! ```

mod config;
mod conversation;
mod transport;

use airembr::flat::records_to_observations;
use airembr::store::{FactPage, FactQuery, ObservationStore};
use airembr::{merge_observations, AirembrError, Observation};

pub use config::{Adapter, ClientConfig, CONFIG_FILE};
pub use conversation::{ConversationMemory, MemorySessions, MemoryTime};
pub use transport::{EntityPage, LocalTransport, QueryStatus, RememberOptions, Transport};

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Core(#[from] AirembrError),
    #[error("configuration error: {0}")]
    Config(String),
    /// The backend answered with a non-success status.
    #[error("{operation} failed with status {status}")]
    Status {
        operation: &'static str,
        status: QueryStatus,
    },
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<figment::Error> for ClientError {
    fn from(e: figment::Error) -> Self {
        ClientError::Config(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;

fn check(operation: &'static str, status: QueryStatus) -> Result<()> {
    if status.is_ok() {
        Ok(())
    } else {
        Err(ClientError::Status { operation, status })
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Entry point of the SDK.
///
/// Constructed explicitly and passed to whoever needs it; there is no
/// process-wide instance.
pub struct MemoryClient {
    transport: Box<dyn Transport>,
    config: ClientConfig,
}

impl MemoryClient {
    /// A client over any transport, e.g. an integrator's HTTP implementation.
    pub fn new(transport: impl Transport + 'static, config: ClientConfig) -> Self {
        Self {
            transport: Box::new(transport),
            config,
        }
    }

    /// A client for the configured adapter.
    ///
    /// Only the local adapter can be built from configuration alone; a remote
    /// backend needs its transport passed to [`MemoryClient::new`].
    pub fn from_config(config: &ClientConfig) -> Result<Self> {
        config.validate()?;
        match config.adapter {
            Adapter::Local => {
                let store = match &config.store_path {
                    Some(path) => {
                        let path = path.to_str().ok_or_else(|| {
                            ClientError::Config(format!("store_path {path:?} is not valid UTF-8"))
                        })?;
                        ObservationStore::open(path)?
                    }
                    None => ObservationStore::open_in_memory()?,
                };
                tracing::info!(
                    store = ?config.store_path,
                    context = config.effective_context(),
                    "opened local memory store"
                );
                Ok(Self::new(LocalTransport::new(store), config.clone()))
            }
            Adapter::Remote => Err(ClientError::Config(
                "the remote adapter has no built-in transport; use MemoryClient::new".to_string(),
            )),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// A fact query with the configured page size.
    pub fn fact_query(&self) -> FactQuery {
        FactQuery::new().limit(self.config.page_limit)
    }

    /// Send observations to the backend and return the per-session
    /// conversation memory it answers with.
    ///
    /// Missing `context` and `tenant` options are filled from the config.
    pub fn observe(
        &self,
        observations: &[Observation],
        options: &RememberOptions,
    ) -> Result<MemorySessions> {
        let payload = observations
            .iter()
            .map(serde_json::to_value)
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut options = options.clone();
        if options.context.is_none() {
            options.context = Some(self.config.effective_context().to_string());
        }
        if options.tenant.is_none() {
            options.tenant = self.config.tenant.clone();
        }

        let (status, sessions) = self.transport.remember(&payload, &options)?;
        check("remember", status)?;
        Ok(sessions)
    }

    pub fn query(&self) -> MemoryQuery<'_> {
        MemoryQuery { client: self }
    }

    /// Query stored facts, convert them back into observations and merge
    /// those sharing `(id, session)`.
    pub fn reconcile(&self, query: &FactQuery) -> Result<Vec<Observation>> {
        let page = self.query().facts(query)?;
        let observations = records_to_observations(&page.records);
        let merged = merge_observations(observations);
        tracing::debug!(
            records = page.records.len(),
            merged = merged.len(),
            "reconciled stored facts"
        );
        Ok(merged)
    }
}

/// Query facade of a [`MemoryClient`]; non-success statuses become
/// [`ClientError::Status`].
pub struct MemoryQuery<'a> {
    client: &'a MemoryClient,
}

impl MemoryQuery<'_> {
    pub fn facts(&self, query: &FactQuery) -> Result<FactPage> {
        let (status, page) = self.client.transport.query_facts(query)?;
        check("query_facts", status)?;
        Ok(page)
    }

    pub fn entity(&self, id: &str, page: usize) -> Result<EntityPage> {
        let limit = self.client.config.page_limit;
        let (status, result) = self.client.transport.query_entity(id, page, limit)?;
        check("query_entity", status)?;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use airembr::{EntityRef, IdentificationPolicy, Instance, ObservedEntity, Relation, Session, Source};
    use serde_json::{json, Value};
    use tempfile::NamedTempFile;

    fn r(s: &str) -> EntityRef {
        EntityRef::parse(s).unwrap()
    }

    fn visit(age: u32, label: &str, at: &str) -> Observation {
        visit_at(age, label, Some(at))
    }

    fn visit_at(age: u32, label: &str, at: Option<&str>) -> Observation {
        let mut relation = Relation::new(label).actor(r("person")).object(r("shop"));
        if let Some(at) = at {
            relation = relation.at(at.parse().unwrap());
        }
        let person = ObservedEntity::builder(Instance::of("person").unwrap())
            .traits(json!({"email": "a@b.com", "age": age}))
            .identification(IdentificationPolicy::new(["email"]))
            .build()
            .unwrap();
        let shop = ObservedEntity::builder(Instance::typed("shop", "s-1").unwrap())
            .build()
            .unwrap();
        Observation::builder(r("person"), Source::new("web"))
            .id("obs-1")
            .session(Session::new("session-1"))
            .entity_as(r("person"), person)
            .entity_as(r("shop"), shop)
            .relation(relation)
            .build()
            .unwrap()
    }

    fn local_client() -> MemoryClient {
        MemoryClient::from_config(&ClientConfig::default()).unwrap()
    }

    #[test]
    fn observe_then_reconcile() {
        let client = local_client();
        let sessions = client
            .observe(
                &[
                    visit(31, "purchased", "2024-01-02T00:00:00Z"),
                    visit(30, "visited", "2024-01-01T00:00:00Z"),
                ],
                &RememberOptions::default(),
            )
            .unwrap();
        assert!(sessions.get_chat_memory("session-1").is_some());

        let merged = client.reconcile(&client.fact_query()).unwrap();
        assert_eq!(merged.len(), 1);
        let obs = &merged[0];
        assert_eq!(obs.key(), ("obs-1", "session-1"));

        let labels: Vec<&str> = obs.relations().iter().map(|r| r.label.as_str()).collect();
        assert_eq!(labels, vec!["visited", "purchased"]);

        let person = obs
            .entities()
            .values()
            .find(|e| e.instance.kind() == "person")
            .unwrap();
        assert_eq!(person.traits["age"], Value::from(31));
    }

    #[test]
    fn reconcile_sorts_untimed_relations_first() {
        let client = local_client();
        client
            .observe(
                &[
                    visit(31, "purchased", "2024-01-02T00:00:00Z"),
                    visit_at(30, "visited", None),
                ],
                &RememberOptions::default(),
            )
            .unwrap();

        let merged = client.reconcile(&client.fact_query()).unwrap();
        assert_eq!(merged.len(), 1);
        let labels: Vec<&str> = merged[0]
            .relations()
            .iter()
            .map(|r| r.label.as_str())
            .collect();
        assert_eq!(labels, vec!["visited", "purchased"]);

        let person = merged[0]
            .entities()
            .values()
            .find(|e| e.instance.kind() == "person")
            .unwrap();
        assert_eq!(person.traits["age"], Value::from(31));
    }

    #[test]
    fn query_facade_pages_entities() {
        let client = local_client();
        client
            .observe(
                &[visit(30, "visited", "2024-01-01T00:00:00Z")],
                &RememberOptions::default(),
            )
            .unwrap();
        let page = client.query().entity("s-1", 0).unwrap();
        assert_eq!(page.total, 1);
        let facts = client
            .query()
            .facts(&client.fact_query().filter("rel.label", "visited"))
            .unwrap();
        assert_eq!(facts.total, 1);
    }

    #[test]
    fn remote_adapter_needs_explicit_transport() {
        let config = ClientConfig {
            adapter: Adapter::Remote,
            api_url: Some("https://api.example.com".into()),
            ..ClientConfig::default()
        };
        assert!(matches!(
            MemoryClient::from_config(&config),
            Err(ClientError::Config(_))
        ));
    }

    #[test]
    fn local_adapter_persists_to_file() {
        let file = NamedTempFile::new().unwrap();
        let config = ClientConfig {
            store_path: Some(file.path().to_path_buf()),
            ..ClientConfig::default()
        };
        {
            let client = MemoryClient::from_config(&config).unwrap();
            client
                .observe(
                    &[visit(30, "visited", "2024-01-01T00:00:00Z")],
                    &RememberOptions::default(),
                )
                .unwrap();
        }
        let client = MemoryClient::from_config(&config).unwrap();
        assert_eq!(client.query().facts(&client.fact_query()).unwrap().total, 1);
    }

    struct Failing;

    impl Transport for Failing {
        fn remember(
            &self,
            _payload: &[Value],
            _options: &RememberOptions,
        ) -> Result<(QueryStatus, MemorySessions)> {
            Ok((QueryStatus(503), MemorySessions::new()))
        }

        fn query_facts(&self, _query: &FactQuery) -> Result<(QueryStatus, FactPage)> {
            Ok((QueryStatus(401), FactPage::default()))
        }

        fn query_entity(
            &self,
            _id: &str,
            _page: usize,
            _limit: usize,
        ) -> Result<(QueryStatus, EntityPage)> {
            Ok((QueryStatus(404), EntityPage::default()))
        }
    }

    #[test]
    fn non_success_status_is_an_error() {
        let client = MemoryClient::new(Failing, ClientConfig::default());
        let err = client
            .observe(
                &[visit(30, "visited", "2024-01-01T00:00:00Z")],
                &RememberOptions::default(),
            )
            .unwrap_err();
        assert_eq!(err.to_string(), "remember failed with status 503");

        assert!(matches!(
            client.reconcile(&FactQuery::new()),
            Err(ClientError::Status { status: QueryStatus(401), .. })
        ));
        assert!(client.query().entity("x", 0).is_err());
    }
}
