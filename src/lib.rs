// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! `statehook` - Subscription registry and change-notification engine for a
//! home-automation state store.
//!
//! The library sits between an external state/object store and REST
//! clients: clients register interest in state or object ids and receive
//! change events either pushed to a webhook URL or pulled through a
//! long-poll session. The gateway keeps the store's subscription set
//! minimal, sweeps unreachable webhooks and abandoned polling sessions,
//! and supports write-then-wait-for-acknowledgement calls.
//!
//! # Components
//!
//! - **Subscription registry**: one record per delivery endpoint, keyed by
//!   a hash of the endpoint identifier, holding watched state and object ids
//! - **Dispatcher**: fans store change notifications out to matching records
//! - **Webhook delivery**: ordered JSON POSTs with a consecutive-failure
//!   budget; hooks failing three times in a row are evicted
//! - **Long-poll sessions**: one parked request per session, short event
//!   backlog, lease-based liveness
//! - **Sweeps**: periodic webhook reachability checks and polling session
//!   garbage collection
//!
//! # Quick Start
//!
//! ## Webhook subscriber
//!
//! ```no_run
//! use statehook::{Gateway, GatewayConfig, Transport, WatchKind};
//! use statehook::store::MemoryStore;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> statehook::Result<()> {
//!     let store = Arc::new(MemoryStore::new());
//!     let gateway = Gateway::new(store.clone(), GatewayConfig::new())?;
//!
//!     // Wire the store's change notifications into the gateway.
//!     let _feed = gateway.spawn_change_feed(store.events());
//!
//!     // The URL is probed with {"test": true} before registration.
//!     gateway
//!         .register_subscribe(
//!             "http://192.168.0.5:9000/hook/",
//!             Transport::Webhook,
//!             WatchKind::State,
//!             "hm-rpc.0.light",
//!             "system.user.admin",
//!         )
//!         .await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Long polling
//!
//! ```no_run
//! use statehook::api::{state, ApiRequest};
//! use statehook::auth::AllowAll;
//! use statehook::{Gateway, GatewayConfig};
//! use statehook::store::MemoryStore;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> statehook::Result<()> {
//!     let store = Arc::new(MemoryStore::new());
//!     let gateway = Gateway::new(store.clone(), GatewayConfig::new())?;
//!     let _feed = gateway.spawn_change_feed(store.events());
//!
//!     // check=true creates the session without parking.
//!     let connect = ApiRequest::new("192.168.0.7")
//!         .with_query("sid", "A")
//!         .with_query("check", "true");
//!     state::polling_get(&gateway, &connect).await;
//!
//!     // Register interest, then park a poll for the next change.
//!     let subscribe = ApiRequest::new("192.168.0.7")
//!         .with_query("method", "polling")
//!         .with_query("sid", "A");
//!     state::subscribe_state(&gateway, &AllowAll, &subscribe, "hm-rpc.0.light").await;
//!
//!     let poll = ApiRequest::new("192.168.0.7")
//!         .with_query("sid", "A")
//!         .with_query("timeout", "30000");
//!     let response = state::polling_get(&gateway, &poll).await;
//!     println!("{response:?}");
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod auth;
pub mod config;
pub mod error;
pub mod gateway;
pub mod hook;
pub mod registry;
pub mod store;

pub use config::GatewayConfig;
pub use error::{Error, Result};
pub use gateway::Gateway;
pub use hook::{DeliveryError, HookDelivery};
pub use registry::{EndpointKey, SubscriberRecord, SubscriberRegistry, Transport, WatchKind};
