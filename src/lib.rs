//! test-rest
//!
//! An HTTP test double. A test harness picks the status code and body an
//! endpoint answers with, can gate request payloads behind a JSON-Schema
//! check, and can push payloads onto a message broker destination.
//!
//! # Features
//!
//! - **Canned outcomes**: `?giveMe=<status>` picks the status code
//! - **Fixture bodies**: `?responseFile=<name>` returns a file verbatim
//! - **Schema gate**: `?schemaFile=<name>` validates POST bodies first
//! - **Broker bridge**: `POST /test-rest/queues?brokerName=<destination>`,
//!   in process or to a STOMP broker
//! - **Listener**: background consumers for configured sources
//!
//! # Example Configuration
//!
//! ```yaml
//! server:
//!   listen: 0.0.0.0:8080
//! fixtures:
//!   response_dir: ./responses
//!   schema_dir: ./schemas
//! broker:
//!   enabled: true
//!   send_timeout_ms: 5000
//!   transport: stomp
//!   connection:
//!     host: mq.internal
//!     port: 61613
//!     username: test
//!     password: test
//!   destinations: [testQueue]
//!   consumer:
//!     sources: [testQueue]
//! ```

pub mod broker;
pub mod config;
pub mod fixture;
pub mod listener;
pub mod resolver;
pub mod schema;
pub mod service;
pub mod stomp;

pub use broker::{BrokerBridge, BrokerClient, BrokerError, InMemoryBroker};
pub use config::TestRestConfig;
pub use listener::{Listener, LoggingHandler, MessageHandler};
pub use resolver::{OutcomeResolver, StatusOutcome};
pub use schema::{SchemaGate, SchemaViolation, ValidationFailure};
pub use service::{router, AppState};
pub use stomp::StompBroker;
