//! # factstream - An Event Store for Immutable Facts
//!
//! factstream stores and streams *facts*: immutable, uniquely identified
//! events in a single global, totally ordered stream. Consumers subscribe with
//! declarative filters, catch up on history, follow live publishes, and resume
//! after disconnects without losing or reordering anything.
//!
//! ## Core Concepts
//!
//! - **Fact**: An immutable event with a header (namespace, type, version,
//!   aggregate ids, meta) and a JSON payload
//! - **FactSpec**: A conjunctive filter; a subscription ORs several together
//! - **Signal**: One unit of pipeline traffic, a fact or a control event
//! - **FactStreamPosition**: A resumable pointer into the global stream
//!
//! ## Usage
//!
//! ```rust,ignore
//! use factstream::{Fact, FactServer, FactSpec, SubscriptionRequest, Subscriber};
//!
//! let server = FactServer::in_memory();
//! server.publish(vec![
//!     Fact::builder("orders").typ("OrderPlaced").build()?,
//! ])?;
//!
//! let request = SubscriptionRequest::follow(FactSpec::ns("orders")).build()?;
//! let subscription = server.subscribe(request, Box::new(observer))?;
//! subscription.await_catchup()?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Core types
pub mod error;
pub mod fact;
pub mod meta;
pub mod position;
pub mod script;
pub mod signal;
pub mod spec;

// Server side: storage, notification fan-in, per-subscription pipeline
pub mod listener;
pub mod metrics;
pub mod pipeline;
pub mod server;
pub mod store;
pub mod transform;

// Client side
pub mod subscription;

// Re-export primary types at crate root for convenience
pub use error::{
    FactError, FactResult, ServerError, SubscriptionError, TransportError, ValidationError,
};
pub use fact::{Fact, FactBuilder};
pub use meta::FactMeta;
pub use position::{FactStreamInfo, FactStreamPosition};
pub use script::FilterScript;
pub use signal::Signal;
pub use spec::{FactSpec, SubscriptionRequest, SubscriptionRequestBuilder};

pub use listener::bus::{EventBus, FactNotification};
pub use listener::{ListenerConfig, NotificationChannel, NotificationConnector, NotificationListener};
pub use metrics::PipelineMetrics;
pub use pipeline::blacklist::{Blacklist, InMemoryBlacklist};
pub use pipeline::{PipelineConfig, SignalSink};
pub use server::{FactServer, ServerConfig, ServerSubscription};
pub use store::memory::InMemoryFactStore;
pub use store::{publish_with_retry, FactStore, StateToken};
pub use transform::{NoTransformers, TransformRequest, Transformers};

pub use subscription::reconnect::{ReconnectConfig, ReconnectWindow, ReconnectingSubscription};
pub use subscription::retry::{RetryConfig, RetryingSubscriber};
pub use subscription::{FactObserver, Subscriber, Subscription};
