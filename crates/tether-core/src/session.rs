//! Session collaborators.
//!
//! The channel does not know how tokens are obtained or what "leaving the
//! session" means for its owner. It reaches both through the small traits
//! below, supplied at construction. Closures implement them directly.

use std::fmt;
use std::sync::Arc;

/// Supplies the authentication token presented when a connection opens.
pub trait CredentialSource: Send + Sync {
    /// The current token, if the owner has one.
    fn token(&self) -> Option<String>;
}

impl<F> CredentialSource for F
where
    F: Fn() -> Option<String> + Send + Sync,
{
    fn token(&self) -> Option<String> {
        self()
    }
}

/// Clears externally held session state when the connection drops.
pub trait SessionTerminationHandler: Send + Sync {
    fn reset(&self);
}

impl<F> SessionTerminationHandler for F
where
    F: Fn() + Send + Sync,
{
    fn reset(&self) {
        self()
    }
}

/// Sends the user somewhere after the session ended.
pub trait NavigationSink: Send + Sync {
    /// Go to `destination`.
    fn navigate(&self, destination: &str);
}

impl<F> NavigationSink for F
where
    F: Fn(&str) + Send + Sync,
{
    fn navigate(&self, destination: &str) {
        self(destination)
    }
}

/// Side effects run when a connection goes away.
#[derive(Clone)]
pub struct SessionHooks {
    terminator: Arc<dyn SessionTerminationHandler>,
    navigator: Arc<dyn NavigationSink>,
}

impl SessionHooks {
    /// Create hooks from a termination handler and a navigation sink.
    #[must_use]
    pub fn new(
        terminator: impl SessionTerminationHandler + 'static,
        navigator: impl NavigationSink + 'static,
    ) -> Self {
        Self {
            terminator: Arc::new(terminator),
            navigator: Arc::new(navigator),
        }
    }

    /// Hooks that do nothing.
    #[must_use]
    pub fn noop() -> Self {
        Self::new(|| {}, |_: &str| {})
    }

    /// Clear the session, then navigate to `home`.
    pub(crate) fn terminate(&self, home: &str) {
        self.terminator.reset();
        self.navigator.navigate(home);
    }
}

impl fmt::Debug for SessionHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHooks").finish_non_exhaustive()
    }
}
