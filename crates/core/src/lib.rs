pub mod auth;
pub mod config;
pub mod error;
pub mod metrics;
pub mod model;
pub mod offset_state;
pub mod pointer;
pub mod template;

pub use auth::{AuthError, Authenticator, NoopAuthenticator, OutboundRequest};
pub use config::{ChainingConfig, ChainRelation, ConnectorConfig, PropertyMap, TemplateConfig};
pub use error::{ConnectError, ErrorClass};
pub use metrics::{InMemoryMetrics, Metrics, NoopMetrics};
pub use model::*;
pub use offset_state::{ODataPhase, OffsetState};
