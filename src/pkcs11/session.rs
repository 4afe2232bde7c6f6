//! The session protocol on top of a loaded module.
//!
//! Sessions are identified by the handle the library returned for them. The
//! module tracks each session it opened together with its slot, so that
//! login can refuse sessions it never saw.
//!
//! Logging in is a property of the token, not of a single session: a login
//! through any session authenticates all of the application's sessions on
//! that slot and a logout through any of them ends it for all. Closing the
//! last session on a slot logs out, too. The table therefore keeps the login
//! state per slot and derives the state of each session from it.

use std::collections::HashMap;
use std::fmt;
use std::ptr;

use cryptoki_sys::*;
use log::{debug, warn};
use parking_lot::Mutex;
use secrecy::{ExposeSecret, SecretVec};

use crate::error::{Error, Result};
use crate::pkcs11::module::Pkcs11Module;
use crate::pkcs11::util::rv_name;


//------------ UserType ------------------------------------------------------

/// The kinds of user that can log in to a token.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum UserType {
    SecurityOfficer,
    User,

    /// Re-authentication for a single operation. Does not change the login
    /// state of the token.
    ContextSpecific,
}

impl From<UserType> for CK_USER_TYPE {
    fn from(user_type: UserType) -> Self {
        match user_type {
            UserType::SecurityOfficer => CKU_SO,
            UserType::User => CKU_USER,
            UserType::ContextSpecific => CKU_CONTEXT_SPECIFIC,
        }
    }
}

impl TryFrom<CK_USER_TYPE> for UserType {
    type Error = Error;

    fn try_from(user_type: CK_USER_TYPE) -> Result<Self> {
        match user_type {
            CKU_SO => Ok(UserType::SecurityOfficer),
            CKU_USER => Ok(UserType::User),
            CKU_CONTEXT_SPECIFIC => Ok(UserType::ContextSpecific),
            other => Err(Error::coded(
                CKR_USER_TYPE_INVALID,
                format!("unknown PKCS#11 user type {}", other),
            )),
        }
    }
}

impl fmt::Display for UserType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            UserType::SecurityOfficer => write!(f, "security officer"),
            UserType::User => write!(f, "user"),
            UserType::ContextSpecific => write!(f, "context specific user"),
        }
    }
}


//------------ SessionState --------------------------------------------------

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SessionState {
    Open,

    /// A user of the given type is logged in to the session's token.
    Authenticated(UserType),
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SessionState::Open => write!(f, "open"),
            SessionState::Authenticated(user_type) => write!(f, "authenticated as {}", user_type),
        }
    }
}


//------------ SessionInfo ---------------------------------------------------

/// A session tracked by a module.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SessionInfo {
    pub handle: CK_SESSION_HANDLE,
    pub slot_id: CK_SLOT_ID,
    pub read_write: bool,
    pub state: SessionState,
}


//------------ SessionTable --------------------------------------------------

#[derive(Clone, Copy, Debug)]
struct Tracked {
    slot_id: CK_SLOT_ID,
    read_write: bool,
}

#[derive(Debug, Default)]
struct Tables {
    sessions: HashMap<CK_SESSION_HANDLE, Tracked>,
    logins: HashMap<CK_SLOT_ID, UserType>,
}

impl Tables {
    fn info(&self, handle: CK_SESSION_HANDLE, tracked: Tracked) -> SessionInfo {
        SessionInfo {
            handle,
            slot_id: tracked.slot_id,
            read_write: tracked.read_write,
            state: match self.logins.get(&tracked.slot_id) {
                Some(user_type) => SessionState::Authenticated(*user_type),
                None => SessionState::Open,
            },
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct SessionTable {
    tables: Mutex<Tables>,
}

impl SessionTable {
    pub fn len(&self) -> usize {
        self.tables.lock().sessions.len()
    }

    fn insert(&self, handle: CK_SESSION_HANDLE, slot_id: CK_SLOT_ID, read_write: bool) {
        self.tables
            .lock()
            .sessions
            .insert(handle, Tracked { slot_id, read_write });
    }

    /// Returns the session if it is tracked for `slot_id`.
    fn get(&self, slot_id: CK_SLOT_ID, handle: CK_SESSION_HANDLE) -> Option<SessionInfo> {
        let tables = self.tables.lock();
        tables
            .sessions
            .get(&handle)
            .filter(|tracked| tracked.slot_id == slot_id)
            .map(|tracked| tables.info(handle, *tracked))
    }

    /// Stops tracking a session.
    ///
    /// If it was the last one on its slot, the slot is logged out.
    fn remove(&self, slot_id: CK_SLOT_ID, handle: CK_SESSION_HANDLE) -> bool {
        let mut tables = self.tables.lock();
        match tables.sessions.get(&handle) {
            Some(tracked) if tracked.slot_id == slot_id => {}
            _ => return false,
        }
        tables.sessions.remove(&handle);
        if !tables.sessions.values().any(|tracked| tracked.slot_id == slot_id) {
            tables.logins.remove(&slot_id);
        }
        true
    }

    fn logged_in(&self, slot_id: CK_SLOT_ID, user_type: UserType) {
        if user_type != UserType::ContextSpecific {
            self.tables.lock().logins.insert(slot_id, user_type);
        }
    }

    fn logged_out(&self, slot_id: CK_SLOT_ID) {
        self.tables.lock().logins.remove(&slot_id);
    }

    fn all(&self) -> Vec<SessionInfo> {
        let tables = self.tables.lock();
        let mut all: Vec<_> = tables
            .sessions
            .iter()
            .map(|(handle, tracked)| tables.info(*handle, *tracked))
            .collect();
        all.sort_by_key(|info| info.handle);
        all
    }
}


//------------ Pkcs11Module: Sessions ----------------------------------------

impl Pkcs11Module {
    /// Opens a serial session on a slot.
    ///
    /// No notification callback is registered with the library.
    pub fn open_session(&self, slot_id: CK_SLOT_ID, read_write: bool) -> Result<CK_SESSION_HANDLE> {
        let mut flags = CKF_SERIAL_SESSION;
        if read_write {
            flags |= CKF_RW_SESSION;
        }

        let mut handle: CK_SESSION_HANDLE = CK_INVALID_HANDLE;
        // SAFETY: the module is initialized and handle is a valid out param.
        let rv = unsafe {
            (self.functions().open_session)(slot_id, flags, ptr::null_mut(), None, &mut handle)
        };
        if rv != CKR_OK {
            return Err(Error::coded(
                rv,
                format!("C_OpenSession for PKCS#11 slot {} failed", slot_id),
            ));
        }
        if handle == CK_INVALID_HANDLE {
            return Err(Error::coded(
                CKR_GENERAL_ERROR,
                format!("C_OpenSession for PKCS#11 slot {} returned no session", slot_id),
            ));
        }

        self.sessions().insert(handle, slot_id, read_write);
        debug!(
            "Opened {} session {} on PKCS#11 slot {} of {}",
            if read_write { "read-write" } else { "read-only" },
            handle,
            slot_id,
            self.name()
        );
        Ok(handle)
    }

    /// Closes a session.
    ///
    /// This never fails: a failure reported by the library is logged and
    /// the session is forgotten anyway.
    pub fn close_session(&self, slot_id: CK_SLOT_ID, handle: CK_SESSION_HANDLE) {
        if !self.sessions().remove(slot_id, handle) {
            warn!(
                "Ignoring close of unknown session {} on PKCS#11 slot {} of {}",
                handle,
                slot_id,
                self.name()
            );
            return;
        }

        // SAFETY: the module is initialized.
        let rv = unsafe { (self.functions().close_session)(handle) };
        if rv != CKR_OK {
            warn!(
                "C_CloseSession for PKCS#11 slot {} of {} failed: {}",
                slot_id,
                self.name(),
                rv_name(rv)
            );
        } else {
            debug!("Closed session {} on PKCS#11 slot {} of {}", handle, slot_id, self.name());
        }
    }

    /// Logs a user in on a session.
    ///
    /// On success all tracked sessions on the slot are authenticated.
    /// Without a secret, or with an empty one, the library is asked to use
    /// its protected authentication path, if it has one.
    pub fn login(
        &self,
        slot_id: CK_SLOT_ID,
        handle: CK_SESSION_HANDLE,
        user_type: UserType,
        secret: Option<&[u8]>,
    ) -> Result<()> {
        if self.sessions().get(slot_id, handle).is_none() {
            return Err(Error::InvalidHandle(format!(
                "session {} for slot {} of {}",
                handle,
                slot_id,
                self.name()
            )));
        }

        // The copy is wiped when it goes out of scope.
        let secret = secret.filter(|secret| !secret.is_empty()).map(|secret| SecretVec::new(secret.to_vec()));
        let (pin, pin_len) = match &secret {
            Some(secret) => {
                let secret = secret.expose_secret();
                (secret.as_ptr() as CK_UTF8CHAR_PTR, secret.len() as CK_ULONG)
            }
            None => (ptr::null_mut(), 0),
        };

        // SAFETY: pin points to pin_len bytes which outlive the call. The
        // library does not write through it.
        let rv = unsafe { (self.functions().login)(handle, user_type.into(), pin, pin_len) };
        if rv != CKR_OK {
            return Err(Error::coded(
                rv,
                format!("C_Login for PKCS#11 slot {} failed", slot_id),
            ));
        }

        self.sessions().logged_in(slot_id, user_type);
        debug!(
            "Logged in as {} on session {} on PKCS#11 slot {} of {}",
            user_type,
            handle,
            slot_id,
            self.name()
        );
        Ok(())
    }

    /// Logs out of a session.
    ///
    /// This ends the login for all sessions on the slot. Like closing, it
    /// never fails.
    pub fn logout(&self, slot_id: CK_SLOT_ID, handle: CK_SESSION_HANDLE) {
        if self.sessions().get(slot_id, handle).is_none() {
            warn!(
                "Ignoring logout of unknown session {} on PKCS#11 slot {} of {}",
                handle,
                slot_id,
                self.name()
            );
            return;
        }

        // SAFETY: the module is initialized.
        let rv = unsafe { (self.functions().logout)(handle) };
        if rv != CKR_OK {
            warn!(
                "C_Logout for PKCS#11 slot {} of {} failed: {}",
                slot_id,
                self.name(),
                rv_name(rv)
            );
        }
        self.sessions().logged_out(slot_id);
    }

    /// Returns the state of a tracked session.
    pub fn session_state(&self, slot_id: CK_SLOT_ID, handle: CK_SESSION_HANDLE) -> Option<SessionState> {
        self.sessions().get(slot_id, handle).map(|info| info.state)
    }

    /// Returns all tracked sessions, ordered by handle.
    pub fn open_sessions(&self) -> Vec<SessionInfo> {
        self.sessions().all()
    }
}


//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::error::ErrorKind;
    use crate::mock::{self, MockBehaviour, MockLoader, MockSlot};

    fn load() -> Pkcs11Module {
        Pkcs11Module::load_with(&MockLoader, Path::new("libmock-pkcs11.so")).unwrap()
    }

    #[test]
    fn read_only_session_uses_serial_flag_only() {
        let mock = mock::install(MockBehaviour::default());
        let module = load();

        let session = module.open_session(0, false).unwrap();
        assert_eq!(session, MockBehaviour::default().session_handle);

        let calls = mock.calls();
        assert_eq!(calls.open_session.len(), 1);
        assert_eq!(calls.open_session[0].slot_id, 0);
        assert_eq!(calls.open_session[0].flags, CKF_SERIAL_SESSION);
        assert!(calls.open_session[0].application_null);
        assert!(!calls.open_session[0].notify_set);
        assert_eq!(module.session_state(0, session), Some(SessionState::Open));
    }

    #[test]
    fn read_write_session_adds_rw_flag() {
        let mock = mock::install(MockBehaviour::default());
        let module = load();

        module.open_session(0, true).unwrap();
        assert_eq!(
            mock.calls().open_session[0].flags,
            CKF_SERIAL_SESSION | CKF_RW_SESSION
        );
        assert!(module.open_sessions()[0].read_write);
    }

    #[test]
    fn failed_open_is_coded_and_untracked() {
        let _mock = mock::install(MockBehaviour {
            open_session_rv: CKR_SESSION_COUNT,
            ..Default::default()
        });
        let module = load();

        let err = module.open_session(0, false).unwrap_err();
        assert_eq!(err.code(), Some(CKR_SESSION_COUNT));
        assert!(err.to_string().contains("slot 0"));
        assert!(module.open_sessions().is_empty());
    }

    #[test]
    fn login_passes_exact_secret_and_type() {
        let mock = mock::install(MockBehaviour::default());
        let module = load();
        let session = module.open_session(0, false).unwrap();

        module.login(0, session, UserType::User, Some(b"1234")).unwrap();

        let calls = mock.calls();
        assert_eq!(calls.login.len(), 1);
        assert_eq!(calls.login[0].session, session);
        assert_eq!(calls.login[0].user_type, CKU_USER);
        assert_eq!(calls.login[0].pin.as_deref(), Some(&b"1234"[..]));
        assert_eq!(calls.login[0].pin_len, 4);
        assert_eq!(
            module.session_state(0, session),
            Some(SessionState::Authenticated(UserType::User))
        );
    }

    #[test]
    fn absent_and_empty_secrets_look_the_same() {
        let mock = mock::install(MockBehaviour::default());
        let module = load();
        let session = module.open_session(0, false).unwrap();

        module.login(0, session, UserType::User, None).unwrap();
        module.login(0, session, UserType::User, Some(b"")).unwrap();

        let calls = mock.calls();
        assert_eq!(calls.login[0], calls.login[1]);
        assert_eq!(calls.login[0].pin, None);
        assert_eq!(calls.login[0].pin_len, 0);
    }

    #[test]
    fn failed_login_surfaces_code() {
        let _mock = mock::install(MockBehaviour {
            login_rv: CKR_PIN_INCORRECT,
            ..Default::default()
        });
        let module = load();
        let session = module.open_session(0, false).unwrap();

        let err = module.login(0, session, UserType::SecurityOfficer, Some(b"0000")).unwrap_err();
        assert_eq!(err.code(), Some(CKR_PIN_INCORRECT));
        assert_eq!(module.session_state(0, session), Some(SessionState::Open));
    }

    #[test]
    fn login_on_unknown_session_is_refused() {
        let mock = mock::install(MockBehaviour::default());
        let module = load();
        let session = module.open_session(0, false).unwrap();

        let err = module.login(0, session + 1, UserType::User, None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidHandle);
        let err = module.login(1, session, UserType::User, None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidHandle);
        assert!(mock.calls().login.is_empty());
    }

    #[test]
    fn logout_returns_to_open_even_on_failure() {
        let mock = mock::install(MockBehaviour {
            logout_rv: CKR_USER_NOT_LOGGED_IN,
            ..Default::default()
        });
        let module = load();
        let session = module.open_session(0, false).unwrap();
        module.login(0, session, UserType::User, Some(b"1234")).unwrap();

        module.logout(0, session);
        assert_eq!(mock.calls().logout, vec![session]);
        assert_eq!(module.session_state(0, session), Some(SessionState::Open));
    }

    #[test]
    fn close_forgets_session_even_on_failure() {
        let mock = mock::install(MockBehaviour {
            close_session_rv: CKR_DEVICE_REMOVED,
            ..Default::default()
        });
        let module = load();
        let session = module.open_session(0, false).unwrap();

        module.close_session(0, session);
        assert_eq!(mock.calls().close_session, vec![session]);
        assert_eq!(module.session_state(0, session), None);

        // A second close does not reach the library.
        module.close_session(0, session);
        assert_eq!(mock.calls().close_session.len(), 1);
    }

    #[test]
    fn login_state_is_shared_by_sessions_on_a_slot() {
        let _mock = mock::install(MockBehaviour::default());
        let module = load();
        let first = module.open_session(0, false).unwrap();
        let second = module.open_session(0, true).unwrap();

        module.login(0, first, UserType::User, Some(b"1234")).unwrap();
        assert_eq!(
            module.session_state(0, second),
            Some(SessionState::Authenticated(UserType::User))
        );

        module.logout(0, first);
        assert_eq!(module.session_state(0, second), Some(SessionState::Open));

        module.login(0, second, UserType::User, Some(b"1234")).unwrap();
        module.logout(0, first);
        assert_eq!(module.session_state(0, first), Some(SessionState::Open));
        assert_eq!(module.session_state(0, second), Some(SessionState::Open));
        assert!(
            module
                .open_sessions()
                .iter()
                .all(|info| info.state == SessionState::Open)
        );
    }

    #[test]
    fn login_state_is_per_slot() {
        let _mock = mock::install(MockBehaviour {
            slots: vec![MockSlot::with_token(0, "first"), MockSlot::with_token(1, "second")],
            ..Default::default()
        });
        let module = load();
        let first = module.open_session(0, false).unwrap();
        let second = module.open_session(1, false).unwrap();

        module.login(0, first, UserType::SecurityOfficer, None).unwrap();
        assert_eq!(
            module.session_state(0, first),
            Some(SessionState::Authenticated(UserType::SecurityOfficer))
        );
        assert_eq!(module.session_state(1, second), Some(SessionState::Open));
    }

    #[test]
    fn new_sessions_join_the_login_and_last_close_ends_it() {
        let _mock = mock::install(MockBehaviour::default());
        let module = load();
        let first = module.open_session(0, false).unwrap();
        module.login(0, first, UserType::User, Some(b"1234")).unwrap();

        let second = module.open_session(0, false).unwrap();
        assert_eq!(
            module.session_state(0, second),
            Some(SessionState::Authenticated(UserType::User))
        );

        module.close_session(0, first);
        assert_eq!(
            module.session_state(0, second),
            Some(SessionState::Authenticated(UserType::User))
        );
        module.close_session(0, second);

        let third = module.open_session(0, false).unwrap();
        assert_eq!(module.session_state(0, third), Some(SessionState::Open));
    }

    #[test]
    fn context_specific_login_leaves_state_alone() {
        let mock = mock::install(MockBehaviour::default());
        let module = load();
        let session = module.open_session(0, false).unwrap();

        module.login(0, session, UserType::ContextSpecific, Some(b"1234")).unwrap();
        assert_eq!(mock.calls().login[0].user_type, CKU_CONTEXT_SPECIFIC);
        assert_eq!(module.session_state(0, session), Some(SessionState::Open));
    }

    #[test]
    fn sessions_get_distinct_handles() {
        let _mock = mock::install(MockBehaviour::default());
        let module = load();
        let first = module.open_session(0, false).unwrap();
        let second = module.open_session(0, true).unwrap();
        assert_ne!(first, second);

        let open = module.open_sessions();
        assert_eq!(open.len(), 2);
        assert_eq!(open[0].handle, first.min(second));
    }

    #[test]
    fn user_types_map_to_raw_values() {
        assert_eq!(CK_USER_TYPE::from(UserType::SecurityOfficer), CKU_SO);
        assert_eq!(CK_USER_TYPE::from(UserType::User), CKU_USER);
        assert_eq!(CK_USER_TYPE::from(UserType::ContextSpecific), CKU_CONTEXT_SPECIFIC);

        assert_eq!(UserType::try_from(CKU_SO).unwrap(), UserType::SecurityOfficer);
        assert_eq!(UserType::try_from(CKU_USER).unwrap(), UserType::User);
        assert_eq!(
            UserType::try_from(42).unwrap_err().code(),
            Some(CKR_USER_TYPE_INVALID)
        );
    }

    #[test]
    fn session_state_display() {
        assert_eq!(SessionState::Open.to_string(), "open");
        assert_eq!(
            SessionState::Authenticated(UserType::User).to_string(),
            "authenticated as user"
        );
        assert_eq!(
            SessionState::Authenticated(UserType::SecurityOfficer).to_string(),
            "authenticated as security officer"
        );
    }
}
