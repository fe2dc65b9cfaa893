//! Safe note mutation over scarce external resources: a bounded HTTP
//! connection pool with retry, a transactional action pipeline with undo,
//! and a TTL cache for search results.

pub mod actions;
pub mod cache;
pub mod clock;
mod config;
pub mod coordinator;
pub mod error;
pub mod kv;
pub mod notify;
pub mod pool;
pub mod retry;
pub mod search;
pub mod store;
pub mod tags;
pub mod transport;
pub mod validation;
pub mod validator;

pub use actions::{
    ActionError, ActionExecutor, ActionKind, ActionOutcome, ActionParams, CreateParams,
    FieldUpdate, ModifyParams, RenameParams, UpdateMode,
};
pub use cache::{CacheStats, QueryCache};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    apply_env_overrides, config_schema_json, load_config, parse_config, CacheConfig, Config,
    CoordinatorConfig, PoolConfig, ValidatorConfig,
};
pub use coordinator::{
    ActionHistoryEntry, FailureStage, OperationFailure, OperationRequest, OperationSuccess,
    ServiceCoordinator, UndoReport,
};
pub use error::ErrorKind;
pub use kv::{FileKvStore, KvStore, MemoryKvStore};
pub use notify::{NoticeKind, Notifier, TracingNotifier};
pub use pool::{ConnectionPool, PoolError, PoolStats, PooledConnection, RequestError};
pub use retry::{Backoff, FetchError, RetryPolicy};
pub use search::{search_titles, CachedSearch};
pub use store::{DocumentStore, Fields, MemoryStore, StoreError};
pub use transport::{HttpRequest, HttpResponse, HttpTransport, ReqwestTransport, TransportError};
pub use validation::{Intent, StateSnapshot, ValidationService, VerificationResult, Violation};
pub use validator::{ActionValidator, RemoteValidator, ValidationRequest, ValidationVerdict};

mod test_support;
