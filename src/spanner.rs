//! Opening Spanner batch read-only transactions from a pipeline.
//!
//! The database client itself is supplied by the caller through
//! [`ClientFactory`]. This module only manages sharing one client per
//! database between all steps on a process, and wraps transaction
//! creation as a [`DoFn`].

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

use crate::dofn::DoFn;
use crate::errors::tracked_err;
use crate::errors::BoxedCause;
use crate::errors::FlowException;
use crate::errors::TrackedError;

#[derive(Debug, Error)]
pub enum TransactionError {
    #[error("timestamp bound {0:?} can't be used for a batch read-only transaction")]
    UnsupportedBound(TimestampBound),
    #[error("accessor for {0} is already closed")]
    Closed(SpannerConfig),
    #[error("error from Spanner client")]
    Client(#[source] BoxedCause),
}

/// Which database to talk to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SpannerConfig {
    pub project_id: String,
    pub instance_id: String,
    pub database_id: String,
    /// Override of the service endpoint, e.g. for an emulator.
    #[serde(default)]
    pub host: Option<String>,
}

impl SpannerConfig {
    pub fn new(
        project_id: impl Into<String>,
        instance_id: impl Into<String>,
        database_id: impl Into<String>,
    ) -> Self {
        Self {
            project_id: project_id.into(),
            instance_id: instance_id.into(),
            database_id: database_id.into(),
            host: None,
        }
    }
}

impl fmt::Display for SpannerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "projects/{}/instances/{}/databases/{}",
            self.project_id, self.instance_id, self.database_id
        )
    }
}

/// How fresh the data read by a transaction has to be.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimestampBound {
    Strong,
    ReadTimestamp(DateTime<Utc>),
    MinReadTimestamp(DateTime<Utc>),
    ExactStaleness(Duration),
    MaxStaleness(Duration),
}

impl TimestampBound {
    /// Batch transactions must read at one well-defined timestamp,
    /// so bounded staleness is not allowed.
    pub fn check_batch(&self) -> Result<(), TransactionError> {
        match self {
            Self::Strong | Self::ReadTimestamp(_) | Self::ExactStaleness(_) => Ok(()),
            other => Err(TransactionError::UnsupportedBound(other.clone())),
        }
    }
}

/// Everything a worker needs to rejoin a batch transaction opened
/// somewhere else.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BatchTransactionId {
    pub session_id: String,
    pub transaction_id: Vec<u8>,
    pub read_timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Transaction {
    id: BatchTransactionId,
}

impl Transaction {
    pub fn create(id: BatchTransactionId) -> Self {
        Self { id }
    }

    pub fn id(&self) -> &BatchTransactionId {
        &self.id
    }
}

pub trait BatchClient: Send + Sync {
    fn batch_read_only_transaction(
        &self,
        bound: &TimestampBound,
    ) -> Result<BatchTransactionId, TransactionError>;
}

pub trait ClientFactory: Send + Sync {
    fn create(&self, config: &SpannerConfig) -> Result<Arc<dyn BatchClient>, TransactionError>;
}

struct SharedClient {
    client: Arc<dyn BatchClient>,
    refs: usize,
}

type ClientMap = HashMap<SpannerConfig, SharedClient>;

fn lock(clients: &Mutex<ClientMap>) -> MutexGuard<'_, ClientMap> {
    clients.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Process-wide cache of clients, one per [`SpannerConfig`].
#[derive(Clone)]
pub struct AccessorRegistry {
    factory: Arc<dyn ClientFactory>,
    clients: Arc<Mutex<ClientMap>>,
}

impl AccessorRegistry {
    pub fn new(factory: impl ClientFactory + 'static) -> Self {
        Self {
            factory: Arc::new(factory),
            clients: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Get a handle to the client for this config, creating the
    /// client if no other handle is open.
    pub fn get_or_create(&self, config: &SpannerConfig) -> Result<SpannerAccessor, TransactionError> {
        let mut clients = lock(&self.clients);
        let shared = match clients.entry(config.clone()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                tracing::info!("Connecting to Spanner database {config}");
                let client = self.factory.create(config)?;
                entry.insert(SharedClient { client, refs: 0 })
            }
        };
        shared.refs += 1;
        Ok(SpannerAccessor {
            config: config.clone(),
            client: Some(shared.client.clone()),
            clients: self.clients.clone(),
        })
    }

    /// Number of open handles for this config.
    pub fn ref_count(&self, config: &SpannerConfig) -> usize {
        lock(&self.clients)
            .get(config)
            .map(|shared| shared.refs)
            .unwrap_or(0)
    }
}

/// A counted reference to a shared client.
///
/// The client is released when the last handle for its config is
/// closed or dropped.
pub struct SpannerAccessor {
    config: SpannerConfig,
    client: Option<Arc<dyn BatchClient>>,
    clients: Arc<Mutex<ClientMap>>,
}

impl SpannerAccessor {
    pub fn batch_client(&self) -> Result<&dyn BatchClient, TransactionError> {
        self.client
            .as_deref()
            .ok_or_else(|| TransactionError::Closed(self.config.clone()))
    }

    /// Closing twice is a no-op.
    pub fn close(&mut self) {
        if self.client.take().is_none() {
            return;
        }
        let mut clients = lock(&self.clients);
        if let Some(shared) = clients.get_mut(&self.config) {
            shared.refs -= 1;
            if shared.refs == 0 {
                tracing::info!("Closing Spanner client for {}", self.config);
                clients.remove(&self.config);
            }
        }
    }
}

impl Drop for SpannerAccessor {
    fn drop(&mut self) {
        self.close();
    }
}

/// Opens one batch read-only transaction per input element.
///
/// The input value is ignored; it only triggers the transaction.
pub struct CreateTransactionFn {
    registry: AccessorRegistry,
    config: SpannerConfig,
    bound: TimestampBound,
    accessor: Option<SpannerAccessor>,
}

impl CreateTransactionFn {
    pub fn new(
        registry: AccessorRegistry,
        config: SpannerConfig,
        bound: TimestampBound,
    ) -> Result<Self, TransactionError> {
        bound.check_batch()?;
        Ok(Self {
            registry,
            config,
            bound,
            accessor: None,
        })
    }
}

impl<I> DoFn<I> for CreateTransactionFn {
    type Output = Transaction;

    fn setup(&mut self) -> Result<(), TrackedError> {
        let config = &self.config;
        self.accessor = Some(
            self.registry
                .get_or_create(config)
                .reraise_with(|| format!("error getting Spanner accessor for {config}"))?,
        );
        Ok(())
    }

    fn process(&mut self, _input: I, output: &mut Vec<Transaction>) -> Result<(), TrackedError> {
        let accessor = self
            .accessor
            .as_ref()
            .ok_or_else(|| tracked_err("Spanner accessor used before setup"))?;
        let id = accessor
            .batch_client()
            .and_then(|client| client.batch_read_only_transaction(&self.bound))
            .reraise("error creating batch read-only transaction")?;
        output.push(Transaction::create(id));
        Ok(())
    }

    fn teardown(&mut self) -> Result<(), TrackedError> {
        if let Some(mut accessor) = self.accessor.take() {
            accessor.close();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;

    use chrono::TimeZone;

    use super::*;
    use crate::dataflow::StepId;
    use crate::dofn::Lifecycle;

    struct FakeClient {
        opened: AtomicUsize,
    }

    impl BatchClient for FakeClient {
        fn batch_read_only_transaction(
            &self,
            _bound: &TimestampBound,
        ) -> Result<BatchTransactionId, TransactionError> {
            let n = self.opened.fetch_add(1, Ordering::SeqCst);
            Ok(BatchTransactionId {
                session_id: "session-1".to_string(),
                transaction_id: vec![n as u8],
                read_timestamp: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            })
        }
    }

    #[derive(Clone, Default)]
    struct FakeFactory {
        created: Arc<AtomicUsize>,
    }

    impl ClientFactory for FakeFactory {
        fn create(&self, _config: &SpannerConfig) -> Result<Arc<dyn BatchClient>, TransactionError> {
            self.created.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(FakeClient {
                opened: AtomicUsize::new(0),
            }))
        }
    }

    fn config() -> SpannerConfig {
        SpannerConfig::new("test-project", "test-instance", "test-db")
    }

    #[test]
    fn accessors_share_one_client_per_config() {
        let factory = FakeFactory::default();
        let registry = AccessorRegistry::new(factory.clone());

        let mut first = registry.get_or_create(&config()).unwrap();
        let second = registry.get_or_create(&config()).unwrap();
        assert_eq!(factory.created.load(Ordering::SeqCst), 1);
        assert_eq!(registry.ref_count(&config()), 2);

        first.close();
        first.close();
        assert_eq!(registry.ref_count(&config()), 1);
        assert!(first.batch_client().is_err());
        assert!(second.batch_client().is_ok());

        drop(second);
        assert_eq!(registry.ref_count(&config()), 0);

        let _third = registry.get_or_create(&config()).unwrap();
        assert_eq!(factory.created.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn different_configs_get_different_clients() {
        let factory = FakeFactory::default();
        let registry = AccessorRegistry::new(factory.clone());

        let _a = registry.get_or_create(&config()).unwrap();
        let _b = registry
            .get_or_create(&SpannerConfig::new("test-project", "test-instance", "other-db"))
            .unwrap();

        assert_eq!(factory.created.load(Ordering::SeqCst), 2);
        assert_eq!(registry.ref_count(&config()), 1);
    }

    #[test]
    fn create_transaction_fn_emits_one_transaction_per_element() {
        let registry = AccessorRegistry::new(FakeFactory::default());
        let dofn = CreateTransactionFn::new(registry.clone(), config(), TimestampBound::Strong).unwrap();

        let mut lifecycle: Lifecycle<(), _> = Lifecycle::setup(StepId::from("create_tx"), dofn).unwrap();
        assert_eq!(registry.ref_count(&config()), 1);

        let mut out = Vec::new();
        lifecycle.process((), &mut out).unwrap();
        lifecycle.process((), &mut out).unwrap();
        lifecycle.teardown().unwrap();

        assert_eq!(out.len(), 2);
        assert_eq!(out[0].id().transaction_id, vec![0]);
        assert_eq!(out[1].id().transaction_id, vec![1]);
        assert_eq!(registry.ref_count(&config()), 0);
    }

    #[test]
    fn bounded_staleness_is_rejected() {
        let registry = AccessorRegistry::new(FakeFactory::default());

        let res = CreateTransactionFn::new(
            registry.clone(),
            config(),
            TimestampBound::MaxStaleness(Duration::from_secs(10)),
        );
        assert!(matches!(res, Err(TransactionError::UnsupportedBound(_))));

        let min_read = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        assert!(TimestampBound::MinReadTimestamp(min_read)
            .check_batch()
            .is_err());
        assert!(TimestampBound::ExactStaleness(Duration::from_secs(10))
            .check_batch()
            .is_ok());
        assert!(TimestampBound::ReadTimestamp(min_read).check_batch().is_ok());
    }
}
