//! Client library for the tourdesk tour booking API.
//!
//! Every call to the API goes through the authenticated
//! [`Dispatcher`](dispatcher::Dispatcher). It attaches the current access
//! token and keeps the session alive: when an access token expires, the
//! session is refreshed once, and concurrent requests share that refresh.
//!
//! # Modules
//!
//! * [`dispatcher`] - authenticated dispatch and the auth lifecycle
//! * [`refresh`] - single-flight refresh coordination
//! * [`store`] - credential storage with change notification
//! * [`session`] - session state derived from the access token
//! * [`token`] - token normalization and claim decoding
//! * [`http`] - request model, transport seam and the production client
//! * [`protocol`] - wire types of the API
//! * [`config`] - client configuration
//! * [`error`] - error types
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

#[macro_use]
extern crate log;

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod http;
pub mod protocol;
pub mod refresh;
pub mod session;
pub mod store;
pub mod token;
