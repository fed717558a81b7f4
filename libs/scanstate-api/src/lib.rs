//! Shared data model and backend traits for the scan state pipeline.
//!
//! This crate has no runtime dependency: store and source traits return
//! boxed futures, so backends are free to pick their own I/O strategy
//! (async client, blocking pool, plain locks).

pub mod error;
pub mod model;
pub mod source;
pub mod store;

pub use error::{DecodeError, SourceError, StoreError};
pub use model::{EntityKey, Observation, ObservationRecord};
pub use source::{Delivery, MessageSource, SourceFuture};
pub use store::{list_order, Page, StateStore, StoreFuture, StoreKind};
