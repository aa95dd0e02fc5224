use std::ops::Deref;

use super::Session;
use crate::error::Error;

/// Keeps a session active for a scope and ends it on drop, on every exit
/// path including early returns and panics.
///
/// Ending only closes admission. Use [`Session::finish`] to wait for
/// requests still running.
#[must_use = "the session ends as soon as the guard is dropped"]
#[derive(Debug)]
pub struct SessionGuard<'a> {
    session: &'a Session,
}

impl Session {
    /// Start the session and return a guard that ends it when dropped.
    pub fn enter(&self) -> Result<SessionGuard<'_>, Error> {
        self.start()?;
        Ok(SessionGuard { session: self })
    }
}

impl SessionGuard<'_> {
    pub fn session(&self) -> &Session {
        self.session
    }
}

impl Deref for SessionGuard<'_> {
    type Target = Session;

    fn deref(&self) -> &Session {
        self.session
    }
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        self.session.end();
    }
}
