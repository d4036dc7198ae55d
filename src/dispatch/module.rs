//! Request handling modules.

use crate::http::{Request, Response};
use crate::session::Session;

/// A request handler in the module chain.
///
/// Modules run in registration order. The first one to return `Ok(true)`
/// claims the request; the chain continues past it only if it allows
/// secondary processing.
///
/// Errors carrying an [`HttpError`](crate::dispatch::HttpError) render that
/// status; any other error is a 500.
pub trait Module: Send + Sync {
    fn process(
        &self,
        request: &Request,
        response: &mut Response,
        session: &mut Session,
    ) -> anyhow::Result<bool>;

    /// Whether later modules may also run after this one handled a request.
    fn allow_secondary_processing(&self) -> bool {
        false
    }
}

/// Adapts a closure into a [`Module`].
///
/// # Example
/// ```
/// use portico::dispatch::FnModule;
///
/// let hello = FnModule::new(|request, response, _session| {
///     if request.path() != "/hello" {
///         return Ok(false);
///     }
///     response.write("hello");
///     Ok(true)
/// });
/// # let _ = hello;
/// ```
pub struct FnModule<F> {
    handler: F,
    secondary: bool,
}

impl<F> FnModule<F>
where
    F: Fn(&Request, &mut Response, &mut Session) -> anyhow::Result<bool> + Send + Sync,
{
    pub fn new(handler: F) -> Self {
        Self {
            handler,
            secondary: false,
        }
    }

    /// Lets later modules run after this one.
    pub fn with_secondary_processing(mut self) -> Self {
        self.secondary = true;
        self
    }
}

impl<F> Module for FnModule<F>
where
    F: Fn(&Request, &mut Response, &mut Session) -> anyhow::Result<bool> + Send + Sync,
{
    fn process(
        &self,
        request: &Request,
        response: &mut Response,
        session: &mut Session,
    ) -> anyhow::Result<bool> {
        (self.handler)(request, response, session)
    }

    fn allow_secondary_processing(&self) -> bool {
        self.secondary
    }
}
