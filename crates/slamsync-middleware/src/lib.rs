//! `slamsync-middleware` – typed fan-out and transform synchronisation.
//!
//! # Modules
//!
//! - [`registry`] – [`ObserverRegistry<T>`][registry::ObserverRegistry]:
//!   synchronous multicast with per-observer failure isolation.
//! - [`topic`] – [`SynchronizedTopic<T>`][topic::SynchronizedTopic]: pairs
//!   observations with their frame transform and fans them out in arrival
//!   order.
//! - [`ingress`] – bounded tokio channel and pump in front of a topic,
//!   retrying parked observations when the buffer changes.

pub mod ingress;
pub mod registry;
pub mod topic;

pub use ingress::{ObservationIngress, spawn_ingress};
pub use registry::{
    DeliveryFailure, DeliveryReport, FnObserver, Observer, ObserverRegistry, SubscriptionId, observer_fn,
};
pub use topic::{
    ObservationOutcome, SynchronizedObservation, SynchronizedTopic, TopicConfig, UnavailablePolicy,
};
