//! SafeLink - the relay core of an offline disaster-relief mesh.
//!
//! # Overview
//!
//! When cellular and internet infrastructure is down, SafeLink nodes relay
//! messages, emergency alerts and relief requests hop by hop between nearby
//! devices. This crate is the delivery engine behind that: it picks the next
//! hop, moves envelopes through a store-and-forward queue with retries, fans
//! broadcasts out geographically, tracks delivery health and raises alerts
//! when the network degrades.
//!
//! Radio links, key management and discovery are collaborators behind
//! traits ([`transport::Transport`], [`crypto::MeshCrypto`],
//! [`peers::PeerSource`]).
//!
//! # API Endpoints
//!
//! - `GET /health` - Liveness check
//! - `GET /health/network` - Delivery health snapshot
//! - `GET|POST /peers` - List peers / record a discovery event
//! - `POST /broadcast` - Geo broadcast
//! - `POST /messages` - Direct message
//! - `GET /messages/summary`, `POST /messages/retry` - Queue inspection and retry
//! - `POST /alerts`, `GET /alerts/recent`, `POST /alerts/auto` - Alerts
//! - `POST /relief`, `GET /relief/open`, `POST /relief/:id/status` - Relief requests
//!
//! # Modules
//!
//! - [`model`]: Data types shared by every component
//! - [`peers`]: Peer directory and the discovery trait
//! - [`router`]: Next-hop scoring
//! - [`priority`]: Keyword urgency classification
//! - [`health`]: Delivery health tracking and classification
//! - [`relay`]: Message queue, delivery and retry
//! - [`broadcast`]: Geographic fan-out and multi-hop relay
//! - [`alerts`]: Manual/automatic alerts and relief requests
//! - [`mesh`]: Composition root
//! - [`storage`]: SQLite persistence
//! - [`api`]: HTTP API handlers

pub mod alerts;
pub mod api;
pub mod broadcast;
pub mod config;
pub mod crypto;
pub mod error;
pub mod geo;
pub mod health;
pub mod mesh;
pub mod model;
pub mod peers;
pub mod priority;
pub mod relay;
pub mod router;
pub mod storage;
pub mod transport;
