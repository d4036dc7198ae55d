//! Request Dispatch
//!
//! Everything between a parsed request and the response written for it:
//! rules, sessions, form decoding, authentication and the module chain.
//!
//! ## Example
//!
//! ```
//! use portico::dispatch::{DispatchSettings, Dispatcher, FnModule, RedirectRule};
//! use portico::session::MemorySessionStore;
//! use std::sync::Arc;
//!
//! let mut dispatcher = Dispatcher::new(
//!     Arc::new(MemorySessionStore::new()),
//!     DispatchSettings::default(),
//! );
//! dispatcher.add_rule(RedirectRule::new("/", "/hello"));
//! dispatcher.add_module(FnModule::new(|request, response, _session| {
//!     if request.path() != "/hello" {
//!         return Ok(false);
//!     }
//!     response.write("hello");
//!     Ok(true)
//! }));
//! ```

pub mod auth;
pub mod dispatcher;
pub mod error;
pub mod module;
pub mod rules;

pub use auth::{request_authentication, AuthenticationModule, BasicAuthentication, AUTH_TAG};
pub use dispatcher::{DispatchSettings, Dispatcher, DEFAULT_SESSION_COOKIE};
pub use error::{find_http_error, HttpError};
pub use module::{FnModule, Module};
pub use rules::{RedirectRule, Rule};
