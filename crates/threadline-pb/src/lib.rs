//! Typed PocketBase client for Threadline.
//!
//! This crate provides the transport layer for the Threadline backend:
//! record CRUD over REST and realtime record events over server-sent events.
//!
//! ## Features
//!
//! - **HTTP Client**: list, fetch, create, update and delete records, with
//!   retries for transient failures
//! - **Realtime**: one shared event stream, multiplexed into typed
//!   per-topic subscriptions, with automatic reconnection
//! - **Records**: typed models for the six Threadline collections
//! - **Filters**: placeholder binding that quotes values safely

mod client;
mod collection;
mod error;
pub mod filter;
pub mod realtime;
mod records;
pub mod sse;
mod types;

pub use client::{PocketBaseClient, PocketBaseClientBuilder};
pub use collection::{Collection, PocketBase};
pub use error::PbError;
pub use filter::{Filter, FilterValue};
pub use realtime::{ConnectionStatus, RealtimeClient, Subscription, SubscriptionGuard, topic_key};
pub use records::*;
pub use types::*;
