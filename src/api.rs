//! The operations offered to a host.
//!
//! A host refers to modules and slots through opaque integer handles and
//! to sessions through the handle the PKCS#11 library gave out. Every
//! operation validates the handles it is given before anything else
//! happens, so a stale or made up handle results in an
//! [`ErrorKind::InvalidHandle`](crate::error::ErrorKind::InvalidHandle)
//! error and never reaches the library.

use std::path::Path;
use std::sync::Arc;

use cryptoki_sys::{CK_SESSION_HANDLE, CK_SLOT_ID};
use log::debug;
use once_cell::sync::Lazy;

use crate::constants::{MODULE_HANDLE_MAGIC, SLOT_HANDLE_MAGIC};
use crate::error::{Error, ErrorKind, Result};
use crate::handle::{Handle, HandleTable};
use crate::pkcs11::library::{LibraryLoader, SharedLibraryLoader};
use crate::pkcs11::{ModuleInfo, Pkcs11Module, SessionInfo, SessionState, Slot, SlotInfo, TokenInfo, UserType};


//------------ Registry ------------------------------------------------------

struct Registry {
    modules: HandleTable<Pkcs11Module>,
    slots: HandleTable<Slot>,
}

static REGISTRY: Lazy<Registry> = Lazy::new(|| Registry {
    modules: HandleTable::new(MODULE_HANDLE_MAGIC, "module"),
    slots: HandleTable::new(SLOT_HANDLE_MAGIC, "slot"),
});

/// Resolves a module and one of its slots.
fn resolve_slot(module: Handle, slot: Handle) -> Result<(Arc<Pkcs11Module>, CK_SLOT_ID)> {
    let pkcs11 = resolve_module(module)?;
    let record = REGISTRY.slots.resolve(slot)?;
    if record.module() != module {
        return Err(Error::invalid_handle("slot", slot));
    }
    Ok((pkcs11, record.id()))
}


//------------ Errors --------------------------------------------------------

/// Creates an error of the given kind for returning to the host.
pub fn throw_error<T>(kind: ErrorKind, message: impl Into<String>) -> Result<T> {
    Err(Error::new(kind, message))
}

/// Creates an error carrying a PKCS#11 result code.
///
/// A code is only meaningful for [`ErrorKind::Pkcs11`]; for any other kind
/// the code is dropped.
pub fn throw_coded_error<T>(kind: ErrorKind, code: cryptoki_sys::CK_RV, message: impl Into<String>) -> Result<T> {
    match kind {
        ErrorKind::Pkcs11 => Err(Error::coded(code, message)),
        kind => Err(Error::new(kind, message)),
    }
}


//------------ Modules -------------------------------------------------------

/// Loads the PKCS#11 library at `path` and returns its handle.
pub fn load_module(path: &str) -> Result<Handle> {
    load_module_with(&SharedLibraryLoader, path)
}

/// Loads a library through the given loader and returns its handle.
pub fn load_module_with(loader: &dyn LibraryLoader, path: &str) -> Result<Handle> {
    if path.is_empty() {
        return throw_error(ErrorKind::InvalidArgument, "no PKCS#11 module path given");
    }
    let module = Pkcs11Module::load_with(loader, Path::new(path))?;
    let handle = REGISTRY.modules.insert(Arc::new(module));
    debug!("Registered PKCS#11 module {} as {:#x}", path, handle);
    Ok(handle)
}

/// Resolves a module handle.
pub fn resolve_module(module: Handle) -> Result<Arc<Pkcs11Module>> {
    REGISTRY.modules.resolve(module)
}

pub fn module_info(module: Handle) -> Result<ModuleInfo> {
    Ok(resolve_module(module)?.info().clone())
}

/// Unloads a module.
///
/// The module handle and all slot handles obtained through it become
/// invalid right away. The library is finalized and closed once no call
/// that already resolved the handle is using it anymore.
pub fn unload_module(module: Handle) -> Result<()> {
    let pkcs11 = REGISTRY.modules.remove(module)?;
    let slots = REGISTRY.slots.remove_where(|slot| slot.module() == module);
    debug!(
        "Unregistered PKCS#11 module {} and {} slot(s)",
        pkcs11.name(),
        slots.len()
    );
    Ok(())
}


//------------ Slots ---------------------------------------------------------

/// Returns the ids of a module's slots.
pub fn slot_list(module: Handle, token_present: bool) -> Result<Vec<CK_SLOT_ID>> {
    resolve_module(module)?.slot_list(token_present)
}

/// Returns a handle for a slot of a module.
pub fn init_slot(module: Handle, slot_id: CK_SLOT_ID) -> Result<Handle> {
    // This fails for slot ids the library doesn't know.
    resolve_module(module)?.slot_info(slot_id)?;
    Ok(REGISTRY.slots.insert(Arc::new(Slot::new(slot_id, module))))
}

/// Returns a handle for the slot holding the token with the given label.
pub fn init_slot_by_label(module: Handle, label: &str) -> Result<Handle> {
    match resolve_module(module)?.find_slot_by_label(label)? {
        Some(slot_id) => Ok(REGISTRY.slots.insert(Arc::new(Slot::new(slot_id, module)))),
        None => throw_error(
            ErrorKind::InvalidArgument,
            format!("no PKCS#11 token with label '{}'", label),
        ),
    }
}

/// Waits for a slot event and returns a handle for the slot it happened in.
///
/// This blocks the calling thread. If the library cannot report slot
/// events, it waits until a slot holds a token instead.
pub fn wait_for_slot(module: Handle) -> Result<Handle> {
    let slot_id = resolve_module(module)?.wait_for_slot()?;
    Ok(REGISTRY.slots.insert(Arc::new(Slot::new(slot_id, module))))
}

/// Invalidates a slot handle.
pub fn destroy_slot(module: Handle, slot: Handle) -> Result<()> {
    resolve_slot(module, slot)?;
    REGISTRY.slots.remove(slot).map(|_| ())
}

pub fn slot_info(module: Handle, slot: Handle) -> Result<SlotInfo> {
    let (pkcs11, slot_id) = resolve_slot(module, slot)?;
    pkcs11.slot_info(slot_id)
}

pub fn token_info(module: Handle, slot: Handle) -> Result<TokenInfo> {
    let (pkcs11, slot_id) = resolve_slot(module, slot)?;
    pkcs11.token_info(slot_id)
}


//------------ Sessions ------------------------------------------------------

pub fn open_session(module: Handle, slot: Handle, read_write: bool) -> Result<CK_SESSION_HANDLE> {
    let (pkcs11, slot_id) = resolve_slot(module, slot)?;
    pkcs11.open_session(slot_id, read_write)
}

/// Closes a session.
///
/// Only invalid module or slot handles are reported. A failure of the
/// library is logged and otherwise ignored.
pub fn close_session(module: Handle, slot: Handle, session: CK_SESSION_HANDLE) -> Result<()> {
    let (pkcs11, slot_id) = resolve_slot(module, slot)?;
    pkcs11.close_session(slot_id, session);
    Ok(())
}

/// Logs in on a session.
///
/// The secret is copied for the duration of the call and wiped afterwards.
/// `None` and an empty secret both select the protected authentication
/// path. A host holding a raw `CK_USER_TYPE` converts it with
/// `UserType::try_from` first.
pub fn login(
    module: Handle,
    slot: Handle,
    session: CK_SESSION_HANDLE,
    user_type: UserType,
    secret: Option<&[u8]>,
) -> Result<()> {
    let (pkcs11, slot_id) = resolve_slot(module, slot)?;
    pkcs11.login(slot_id, session, user_type, secret)
}

/// Logs out of a session.
///
/// Like [`close_session`], failures of the library are only logged.
pub fn logout(module: Handle, slot: Handle, session: CK_SESSION_HANDLE) -> Result<()> {
    let (pkcs11, slot_id) = resolve_slot(module, slot)?;
    pkcs11.logout(slot_id, session);
    Ok(())
}

/// Returns the state of a session.
pub fn session_state(module: Handle, slot: Handle, session: CK_SESSION_HANDLE) -> Result<SessionState> {
    let (pkcs11, slot_id) = resolve_slot(module, slot)?;
    pkcs11
        .session_state(slot_id, session)
        .ok_or_else(|| Error::InvalidHandle(format!("session {} for slot {}", session, slot_id)))
}

/// Returns all sessions open on a module.
pub fn open_sessions(module: Handle) -> Result<Vec<SessionInfo>> {
    Ok(resolve_module(module)?.open_sessions())
}


//------------ Tests ---------------------------------------------------------
