#![cfg_attr(docsrs, feature(doc_cfg))]

//! Library components for the sw3d profile server.
//!
//! # Overview
//! This crate exposes:
//! - [`config::ConfigStore`] and [`config::Settings`]: the flat key/value
//!   configuration, bootstrapped with defaults on first run.
//! - [`supervisor::Supervisor`]: boots the data store, listener, and console,
//!   then owns the shutdown cascade.
//! - [`listener`], [`worker`], and [`connections`]: the accept loop, one task
//!   per client, and the registry of live connections.
//!
//! # Examples
//! ```rust,no_run
//! use std::sync::Arc;
//! use sw3d::config::CliArgs;
//! use sw3d::protocol::DrainHandler;
//! use sw3d::store::MySqlConnector;
//! use sw3d::supervisor::{Collaborators, Supervisor};
//!
//! # async fn demo() {
//! let args = CliArgs::for_config("./config.toml");
//! let collaborators =
//!     Collaborators::new(Arc::new(MySqlConnector::default()), Arc::new(DrainHandler));
//! let outcome = Supervisor::start(&args, collaborators).await.run().await;
//! println!("{outcome:?}");
//! # }
//! ```
pub mod config;
pub mod connections;
pub mod console;
pub mod lifecycle;
pub mod listener;
pub mod logging;
pub mod protocol;
pub mod store;
pub mod supervisor;
pub mod worker;
