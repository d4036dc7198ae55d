//! The request dispatcher.
//!
//! ## Request Flow
//!
//! ```text
//! request ──► rules ──(handled)──────────────────────────────► send
//!               │
//!               ▼
//!          cookies + session
//!               │
//!               ▼
//!          form decoding ──► authentication ──(challenge)──────► send
//!               │
//!               ▼
//!          modules, in order ──(error)──► error page / 401 ───► send
//!               │
//!               ▼
//!          404 if unhandled, session saved, response completed
//! ```
//!
//! Failures that escape all of this (including panics in handlers) end up
//! in [`Dispatcher::handle_failure`], which answers 500 when it still can
//! and always closes the connection.

use crate::connection::{ConnectionClosed, ConnectionHandle, Disposition};
use crate::dispatch::auth::{request_authentication, AuthenticationModule, AUTH_TAG};
use crate::dispatch::error::{find_http_error, HttpError};
use crate::dispatch::module::Module;
use crate::dispatch::rules::Rule;
use crate::http::{FormDecoderProvider, Request, RequestCookies, Response, ResponseCookie, ResponseError};
use crate::protocol::StatusCode;
use crate::server::RequestProcessor;
use crate::session::{Session, SessionStore, MAX_SESSION_ID_LEN};
use anyhow::Result;
use std::any::Any;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Default name of the session cookie.
pub const DEFAULT_SESSION_COOKIE: &str = "__tiny_sessid";

type RealmResolver = dyn Fn(&str) -> String + Send + Sync;
type ExceptionHook = dyn Fn(&anyhow::Error) + Send + Sync;

/// Dispatcher settings.
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub session_cookie_name: String,
    /// `Server` header value; empty omits the header
    pub server_name: String,
    /// Advertised in `Keep-Alive: timeout=N` on persistent responses
    pub keep_alive_timeout: Option<Duration>,
    /// Include error details in 500 and error pages
    pub show_error_details: bool,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            session_cookie_name: DEFAULT_SESSION_COOKIE.to_string(),
            server_name: "portico".to_string(),
            keep_alive_timeout: None,
            show_error_details: false,
        }
    }
}

/// Turns parsed requests into responses.
pub struct Dispatcher {
    rules: Vec<Box<dyn Rule>>,
    modules: Vec<Box<dyn Module>>,
    auth_modules: Vec<Box<dyn AuthenticationModule>>,
    sessions: Arc<dyn SessionStore>,
    decoders: FormDecoderProvider,
    settings: DispatchSettings,
    realm_resolver: Option<Box<RealmResolver>>,
    exception_hook: Option<Box<ExceptionHook>>,
}

impl Dispatcher {
    /// Creates a dispatcher with the built-in form decoders and no rules,
    /// modules or authentication.
    pub fn new(sessions: Arc<dyn SessionStore>, settings: DispatchSettings) -> Self {
        Self {
            rules: Vec::new(),
            modules: Vec::new(),
            auth_modules: Vec::new(),
            sessions,
            decoders: FormDecoderProvider::with_defaults(),
            settings,
            realm_resolver: None,
            exception_hook: None,
        }
    }

    pub fn add_rule(&mut self, rule: impl Rule + 'static) {
        self.rules.push(Box::new(rule));
    }

    pub fn add_module(&mut self, module: impl Module + 'static) {
        self.modules.push(Box::new(module));
    }

    /// Registers an authentication scheme. The first one registered issues
    /// challenges when no better candidate exists.
    pub fn add_auth_module(&mut self, module: impl AuthenticationModule + 'static) {
        self.auth_modules.push(Box::new(module));
    }

    pub fn set_session_store(&mut self, sessions: Arc<dyn SessionStore>) {
        self.sessions = sessions;
    }

    pub fn set_decoders(&mut self, decoders: FormDecoderProvider) {
        self.decoders = decoders;
    }

    /// Maps the request's host to an authentication realm.
    pub fn set_realm_resolver<F>(&mut self, resolver: F)
    where
        F: Fn(&str) -> String + Send + Sync + 'static,
    {
        self.realm_resolver = Some(Box::new(resolver));
    }

    /// Called with every unhandled failure before the 500 is sent.
    pub fn set_exception_hook<F>(&mut self, hook: F)
    where
        F: Fn(&anyhow::Error) + Send + Sync + 'static,
    {
        self.exception_hook = Some(Box::new(hook));
    }

    pub fn settings(&self) -> &DispatchSettings {
        &self.settings
    }

    pub fn sessions(&self) -> &Arc<dyn SessionStore> {
        &self.sessions
    }

    fn process_request(&self, mut request: Request, response: &mut Response) -> Result<()> {
        for rule in &self.rules {
            if rule.process(&request, response) {
                if !response.is_sent() {
                    complete(response)?;
                }
                return Ok(());
            }
        }

        if let Some(header) = request.header("cookie") {
            let cookies = RequestCookies::parse(header);
            request.set_cookies(cookies);
        }

        let (mut session, has_cookie) = self.resolve_session(&request);
        self.handle_request(&mut request, response, &mut session, has_cookie)
    }

    /// Finds the session named by the request's cookie, or starts one.
    ///
    /// The flag tells whether the client already carries a usable cookie.
    fn resolve_session(&self, request: &Request) -> (Session, bool) {
        let name = &self.settings.session_cookie_name;
        let Some(cookie) = request.cookies().get(name) else {
            return (self.sessions.create(), false);
        };

        let id = cookie.value();
        if id.is_empty() || id.len() > MAX_SESSION_ID_LEN {
            warn!(
                client = ?request.remote_addr(),
                length = id.len(),
                "Rejected malformed session cookie"
            );
            self.sessions.remove(id);
            return (self.sessions.create(), false);
        }

        let session = self
            .sessions
            .load(id)
            .unwrap_or_else(|| self.sessions.create_with_id(id));
        (session, true)
    }

    fn handle_request(
        &self,
        request: &mut Request,
        response: &mut Response,
        session: &mut Session,
        has_cookie: bool,
    ) -> Result<()> {
        match self.run_chain(request, response, session) {
            Ok(true) => {}
            Ok(false) => {
                if response.status() == StatusCode::OK {
                    response.set_status(StatusCode::NOT_FOUND);
                    response.set_content_type("text/plain; charset=utf-8");
                    response.set_body(format!("Resource not found: {}", request.uri()));
                }
            }
            Err(err) => {
                if response.headers_sent() {
                    return Err(err);
                }
                let Some(http_error) = find_http_error(&err) else {
                    return Err(err);
                };
                self.render_http_error(request, response, http_error, &err);
            }
        }

        if !response.headers_sent() && session.is_modified() {
            if let Err(e) = self.sessions.save(session) {
                warn!(session = session.id(), error = %e, "Failed to save session");
            }
            if !has_cookie {
                let cookie = ResponseCookie::new(self.settings.session_cookie_name.clone(), session.id());
                response.set_cookie(cookie)?;
            }
        }

        if !response.is_sent() {
            complete(response)?;
        }
        Ok(())
    }

    /// Form decoding, authentication and the module chain.
    ///
    /// Returns whether anything handled the request.
    fn run_chain(
        &self,
        request: &mut Request,
        response: &mut Response,
        session: &mut Session,
    ) -> Result<bool> {
        self.decode_body(request)?;

        if !self.process_authentication(request, response, session)? {
            // Challenge issued
            return Ok(true);
        }

        let mut handled = false;
        for module in &self.modules {
            if module.process(request, response, session)? {
                handled = true;
                if !module.allow_secondary_processing() {
                    break;
                }
            }
        }
        Ok(handled)
    }

    fn decode_body(&self, request: &mut Request) -> Result<(), HttpError> {
        if request.body().is_empty() {
            return Ok(());
        }
        let Some(content_type) = request.content_type() else {
            return Ok(());
        };

        let form = self
            .decoders
            .decode(content_type, request.body())
            .map_err(|e| HttpError::internal("Failed to decode form data.").with_source(e))?;
        if let Some(form) = form {
            request.set_form(form);
        }
        Ok(())
    }

    /// Authenticates the request if any authentication module is installed.
    ///
    /// Returns false when a challenge was written and processing must stop.
    fn process_authentication(
        &self,
        request: &Request,
        response: &mut Response,
        session: &mut Session,
    ) -> Result<bool, HttpError> {
        let Some(default_module) = self.auth_modules.first() else {
            return Ok(true);
        };

        let realm = self.realm(request);
        let header = request.header("authorization");
        let mut principal = None;

        if let Some(header) = header {
            let (scheme, _) = header
                .split_once(' ')
                .ok_or_else(|| HttpError::bad_request("Invalid authorization header"))?;
            let scheme = scheme.to_ascii_lowercase();

            if let Some(module) = self.auth_modules.iter().find(|m| m.name() == scheme) {
                principal = module.authenticate(header, &realm, request.method())?;
            }
        }

        match principal {
            Some(principal) => {
                debug!(user = %principal, realm = %realm, "Authenticated");
                session.set(AUTH_TAG, principal);
                Ok(true)
            }
            None => {
                if let Some(module) = self
                    .auth_modules
                    .iter()
                    .find(|m| m.authentication_required(request))
                {
                    request_authentication(module.as_ref(), &realm, response);
                    return Ok(false);
                }
                // Credentials were offered and refused
                if header.is_some() {
                    request_authentication(default_module.as_ref(), &realm, response);
                    return Ok(false);
                }
                Ok(true)
            }
        }
    }

    fn render_http_error(
        &self,
        request: &Request,
        response: &mut Response,
        http_error: &HttpError,
        err: &anyhow::Error,
    ) {
        if http_error.status() == StatusCode::UNAUTHORIZED {
            if let Some(module) = self.auth_modules.first() {
                let realm = self.realm(request);
                response.clear_body();
                request_authentication(module.as_ref(), &realm, response);
                return;
            }
        }

        debug!(status = %http_error.status(), error = %http_error, "Request failed");
        response.set_status(http_error.status());
        response.set_content_type("text/plain; charset=utf-8");
        if self.settings.show_error_details {
            response.set_body(format!("{:?}", err));
        } else {
            response.set_body(http_error.message());
        }
    }

    fn realm(&self, request: &Request) -> String {
        match &self.realm_resolver {
            Some(resolver) => resolver(request.header("host").unwrap_or("localhost")),
            None => self.settings.server_name.clone(),
        }
    }

    /// Last-resort handling for a request that failed outside any error
    /// page.
    fn handle_failure(
        &self,
        conn: &ConnectionHandle,
        response: &Response,
        err: anyhow::Error,
    ) -> Disposition {
        if is_disconnect(&err) {
            debug!(client = %conn.remote_addr(), "Client went away during request");
            return Disposition::Close;
        }

        error!(client = %conn.remote_addr(), error = ?err, "Request processing failed");
        if let Some(hook) = &self.exception_hook {
            hook(&err);
        }

        if response.headers_sent() {
            return Disposition::Close;
        }

        let mut body = String::from("Internal server error");
        if self.settings.show_error_details {
            body.push_str(&format!("\r\n\r\n{:?}", err));
        }

        if let Err(e) = conn.respond(response.version(), StatusCode::INTERNAL_SERVER_ERROR, &body) {
            error!(
                client = %conn.remote_addr(),
                error = %e,
                fatal = true,
                "Could not send 500 response"
            );
        }
        Disposition::Close
    }
}

impl RequestProcessor for Dispatcher {
    fn process(&self, conn: &ConnectionHandle, request: Request) -> Disposition {
        let mut response = Response::new(conn.clone(), &request);
        response.set_server_name(self.settings.server_name.clone());
        response.set_keep_alive_timeout(self.settings.keep_alive_timeout);
        let keep_alive = request.is_keep_alive();

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            self.process_request(request, &mut response)
        }));
        let result = match outcome {
            Ok(result) => result,
            Err(payload) => Err(anyhow::anyhow!(
                "handler panicked: {}",
                panic_message(payload.as_ref())
            )),
        };

        match result {
            Ok(()) if keep_alive && !response.wants_close() => Disposition::KeepAlive,
            Ok(()) => Disposition::Close,
            Err(err) => self.handle_failure(conn, &response, err),
        }
    }

    fn reject(&self, conn: &ConnectionHandle, request: Request) -> Disposition {
        let mut response = Response::new(conn.clone(), &request);
        response.set_server_name(self.settings.server_name.clone());
        response.set_status(StatusCode::SERVICE_UNAVAILABLE);
        response.set_content_type("text/plain; charset=utf-8");
        response.set_body("Server too busy");

        match response.send() {
            Ok(()) if request.is_keep_alive() && !response.wants_close() => Disposition::KeepAlive,
            Ok(()) => Disposition::Close,
            Err(e) => {
                debug!(client = %conn.remote_addr(), error = %e, "Could not send 503 response");
                Disposition::Close
            }
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("rules", &self.rules.len())
            .field("modules", &self.modules.len())
            .field("auth_modules", &self.auth_modules.len())
            .field("decoders", &self.decoders)
            .field("settings", &self.settings)
            .finish()
    }
}

/// Sends a buffered response, or ends a streamed one.
fn complete(response: &mut Response) -> Result<(), ResponseError> {
    if response.headers_sent() {
        response.finish()
    } else {
        response.send()
    }
}

/// Whether the failure only means the client is gone.
fn is_disconnect(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        if cause.downcast_ref::<ConnectionClosed>().is_some() {
            return true;
        }
        if let Some(ResponseError::Disconnected(_)) = cause.downcast_ref::<ResponseError>() {
            return true;
        }
        cause.downcast_ref::<io::Error>().is_some_and(|e| {
            matches!(
                e.kind(),
                io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::NotConnected
            )
        })
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
