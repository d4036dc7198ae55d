//! Rules: checks that run before sessions and modules and can answer a
//! request on their own.

use crate::http::{Request, Response};

/// A pre-dispatch rule.
///
/// Returning `true` means the rule fully handled the request: nothing else
/// runs and the response is sent as the rule left it.
pub trait Rule: Send + Sync {
    fn process(&self, request: &Request, response: &mut Response) -> bool;
}

/// Redirects one exact path to another location.
///
/// # Example
/// ```
/// use portico::dispatch::RedirectRule;
///
/// let rule = RedirectRule::new("/", "/index.html");
/// assert_eq!(rule.from(), "/");
/// ```
#[derive(Debug, Clone)]
pub struct RedirectRule {
    from: String,
    to: String,
}

impl RedirectRule {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }

    pub fn from(&self) -> &str {
        &self.from
    }

    pub fn to(&self) -> &str {
        &self.to
    }
}

impl Rule for RedirectRule {
    fn process(&self, request: &Request, response: &mut Response) -> bool {
        if request.path() != self.from {
            return false;
        }
        response.redirect(self.to.clone());
        true
    }
}
