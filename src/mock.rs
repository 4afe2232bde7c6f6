//! An in-process fake PKCS#11 library.
//!
//! The mock provides a [`MockLoader`] that "opens" a library whose
//! `C_GetFunctionList` hands out a function table implemented right here.
//! Its behaviour is configured through [`MockBehaviour`] and every call it
//! receives is recorded in [`MockCalls`], including the number of times the
//! library was opened and closed and the mutexes it created through the
//! callbacks it was initialized with.
//!
//! There is only one mock library per process. Tests using it must hold the
//! [`MockGuard`] returned by [`install`] for as long as they use it, which
//! also serializes them.

use std::path::Path;
use std::ptr;
use std::slice;

use cryptoki_sys::*;
use once_cell::sync::Lazy;
use parking_lot::{Mutex, MutexGuard};

use crate::constants::PKCS11_ENTRY_POINT;
use crate::pkcs11::library::{GetFunctionListFn, LibraryLoader, LoadedLibrary};
use crate::pkcs11::util::fill_padded;


//------------ MockBehaviour -------------------------------------------------

/// How the mock library behaves.
///
/// The `*_rv` fields are returned by the respective functions. Functions
/// that produce a result only do so if their code is `CKR_OK`.
#[derive(Clone, Debug)]
pub struct MockBehaviour {
    /// Whether the library can be opened at all.
    pub openable: bool,

    /// Whether the library exports `C_GetFunctionList`.
    pub export_entry_point: bool,

    /// Whether the function table lacks `C_Login`.
    pub incomplete_function_list: bool,

    /// Whether `C_Initialize` may be called again before `C_Finalize`.
    ///
    /// Each initialization then needs its own finalization. This allows
    /// several modules to be loaded from the one mock library.
    pub reinitializable: bool,

    pub get_function_list_rv: CK_RV,
    pub initialize_rv: CK_RV,
    pub finalize_rv: CK_RV,
    pub get_info_rv: CK_RV,
    pub open_session_rv: CK_RV,
    pub close_session_rv: CK_RV,
    pub login_rv: CK_RV,
    pub logout_rv: CK_RV,

    /// Returned by `C_WaitForSlotEvent`. Use `CKR_FUNCTION_NOT_SUPPORTED`
    /// to make callers fall back to polling.
    pub wait_for_slot_event_rv: CK_RV,

    /// The slot reported by a successful `C_WaitForSlotEvent`.
    pub slot_event: CK_SLOT_ID,

    pub cryptoki_version: (u8, u8),
    pub manufacturer: String,
    pub description: String,

    pub slots: Vec<MockSlot>,

    /// The handle of the first session opened. Later ones count up.
    pub session_handle: CK_SESSION_HANDLE,
}

impl Default for MockBehaviour {
    fn default() -> Self {
        MockBehaviour {
            openable: true,
            export_entry_point: true,
            incomplete_function_list: false,
            reinitializable: false,
            get_function_list_rv: CKR_OK,
            initialize_rv: CKR_OK,
            finalize_rv: CKR_OK,
            get_info_rv: CKR_OK,
            open_session_rv: CKR_OK,
            close_session_rv: CKR_OK,
            login_rv: CKR_OK,
            logout_rv: CKR_OK,
            wait_for_slot_event_rv: CKR_OK,
            slot_event: 0,
            cryptoki_version: (2, 20),
            manufacturer: "TestCA".to_string(),
            description: "MockToken".to_string(),
            slots: vec![MockSlot::with_token(0, "mock")],
            session_handle: 0x5e55,
        }
    }
}

#[derive(Clone, Debug)]
pub struct MockSlot {
    pub id: CK_SLOT_ID,

    /// The label of the token in the slot, if there is one.
    pub token_label: Option<String>,
}

impl MockSlot {
    pub fn empty(id: CK_SLOT_ID) -> Self {
        MockSlot { id, token_label: None }
    }

    pub fn with_token(id: CK_SLOT_ID, label: &str) -> Self {
        MockSlot {
            id,
            token_label: Some(label.to_string()),
        }
    }
}


//------------ MockCalls -----------------------------------------------------

/// Everything the mock library has seen since it was installed.
#[derive(Clone, Debug, Default)]
pub struct MockCalls {
    pub libraries_opened: usize,
    pub libraries_closed: usize,

    pub initialize: usize,
    pub finalize: usize,
    pub get_info: usize,
    pub get_slot_list: usize,

    /// The flags of the last `C_Initialize` with arguments.
    pub init_flags: Option<CK_FLAGS>,

    /// The mutex callbacks of the last `C_Initialize` providing all four.
    pub mutex_callbacks: Option<MutexCallbacks>,

    pub mutexes_created: usize,
    pub mutexes_destroyed: usize,

    pub open_session: Vec<OpenSessionCall>,
    pub close_session: Vec<CK_SESSION_HANDLE>,
    pub login: Vec<LoginCall>,
    pub logout: Vec<CK_SESSION_HANDLE>,

    /// The flags of each `C_WaitForSlotEvent` call.
    pub wait_for_slot_event: Vec<CK_FLAGS>,
}

#[derive(Clone, Copy, Debug)]
pub struct MutexCallbacks {
    pub create: unsafe extern "C" fn(CK_VOID_PTR_PTR) -> CK_RV,
    pub destroy: unsafe extern "C" fn(CK_VOID_PTR) -> CK_RV,
    pub lock: unsafe extern "C" fn(CK_VOID_PTR) -> CK_RV,
    pub unlock: unsafe extern "C" fn(CK_VOID_PTR) -> CK_RV,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct OpenSessionCall {
    pub slot_id: CK_SLOT_ID,
    pub flags: CK_FLAGS,
    pub application_null: bool,
    pub notify_set: bool,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LoginCall {
    pub session: CK_SESSION_HANDLE,
    pub user_type: CK_USER_TYPE,

    /// The bytes passed as PIN, or `None` for a null pointer.
    pub pin: Option<Vec<u8>>,
    pub pin_len: CK_ULONG,
}


//------------ install -------------------------------------------------------

#[derive(Default)]
struct MockState {
    behaviour: MockBehaviour,
    calls: MockCalls,

    /// The number of initializations not yet finalized.
    instances: usize,

    /// The mutex the library created through the callbacks, as an address.
    library_mutex: Option<usize>,

    sessions: Vec<CK_SESSION_HANDLE>,
    next_session: CK_SESSION_HANDLE,
}

static STATE: Lazy<Mutex<MockState>> = Lazy::new(|| Mutex::new(MockState::default()));

static SERIAL: Mutex<()> = parking_lot::const_mutex(());

/// Waits for exclusive use of the mock library and other process wide state.
///
/// This does not reset the mock, see [`install`] for that.
pub fn serialize() -> MutexGuard<'static, ()> {
    SERIAL.lock()
}

/// Takes exclusive use of the mock library and resets it.
pub fn install(behaviour: MockBehaviour) -> MockGuard {
    let serial = serialize();
    let next_session = behaviour.session_handle;
    *STATE.lock() = MockState {
        behaviour,
        next_session,
        ..Default::default()
    };
    MockGuard { _serial: serial }
}

/// Exclusive use of the mock library.
pub struct MockGuard {
    _serial: MutexGuard<'static, ()>,
}

impl MockGuard {
    /// Returns a snapshot of the calls received so far.
    pub fn calls(&self) -> MockCalls {
        STATE.lock().calls.clone()
    }

    /// Changes the behaviour of the installed library.
    pub fn update(&self, op: impl FnOnce(&mut MockBehaviour)) {
        op(&mut STATE.lock().behaviour)
    }

    /// Returns whether the library is currently initialized.
    pub fn is_initialized(&self) -> bool {
        STATE.lock().instances > 0
    }
}


//------------ MockLoader ----------------------------------------------------

/// Opens the mock library regardless of the path.
#[derive(Clone, Copy, Debug, Default)]
pub struct MockLoader;

impl LibraryLoader for MockLoader {
    fn open(&self, path: &Path) -> Result<Box<dyn LoadedLibrary>, String> {
        let mut state = STATE.lock();
        if !state.behaviour.openable {
            return Err(format!(
                "{}: cannot open shared object file: No such file or directory",
                path.display()
            ));
        }
        state.calls.libraries_opened += 1;
        Ok(Box::new(MockLibrary {
            export_entry_point: state.behaviour.export_entry_point,
        }))
    }
}

#[derive(Debug)]
struct MockLibrary {
    export_entry_point: bool,
}

impl LoadedLibrary for MockLibrary {
    fn function_list_entry(&self, symbol: &str) -> Result<GetFunctionListFn, String> {
        if self.export_entry_point && symbol == PKCS11_ENTRY_POINT {
            Ok(get_function_list)
        } else {
            Err(format!("undefined symbol: {}", symbol))
        }
    }
}

impl Drop for MockLibrary {
    fn drop(&mut self) {
        STATE.lock().calls.libraries_closed += 1;
    }
}


//------------ Function List -------------------------------------------------

static FUNCTION_LIST: Lazy<CK_FUNCTION_LIST> = Lazy::new(|| function_list(true));
static INCOMPLETE_FUNCTION_LIST: Lazy<CK_FUNCTION_LIST> = Lazy::new(|| function_list(false));

fn function_list(complete: bool) -> CK_FUNCTION_LIST {
    // SAFETY: the list consists of a version and optional function
    // pointers, for which zeroes are valid and mean "not provided".
    let mut list: CK_FUNCTION_LIST = unsafe { std::mem::zeroed() };
    list.version = CK_VERSION { major: 2, minor: 20 };
    list.C_Initialize = Some(initialize);
    list.C_Finalize = Some(finalize);
    list.C_GetInfo = Some(get_info);
    list.C_GetFunctionList = Some(get_function_list);
    list.C_GetSlotList = Some(get_slot_list);
    list.C_GetSlotInfo = Some(get_slot_info);
    list.C_GetTokenInfo = Some(get_token_info);
    list.C_WaitForSlotEvent = Some(wait_for_slot_event);
    list.C_OpenSession = Some(open_session);
    list.C_CloseSession = Some(close_session);
    if complete {
        list.C_Login = Some(login);
    }
    list.C_Logout = Some(logout);
    list
}

/// Runs `op` while holding the mutex the library created, if any.
fn with_library_lock<R>(op: impl FnOnce(&mut MockState) -> R) -> R {
    let (callbacks, mutex) = {
        let state = STATE.lock();
        (state.calls.mutex_callbacks, state.library_mutex)
    };
    let lock = callbacks.zip(mutex);

    if let Some((callbacks, mutex)) = lock {
        // SAFETY: the mutex was created through these callbacks.
        unsafe { (callbacks.lock)(mutex as CK_VOID_PTR) };
    }
    let res = op(&mut *STATE.lock());
    if let Some((callbacks, mutex)) = lock {
        // SAFETY: locked above on this thread.
        unsafe { (callbacks.unlock)(mutex as CK_VOID_PTR) };
    }
    res
}

unsafe extern "C" fn get_function_list(list: CK_FUNCTION_LIST_PTR_PTR) -> CK_RV {
    if list.is_null() {
        return CKR_ARGUMENTS_BAD;
    }
    let state = STATE.lock();
    if state.behaviour.get_function_list_rv != CKR_OK {
        return state.behaviour.get_function_list_rv;
    }
    let table: &CK_FUNCTION_LIST = if state.behaviour.incomplete_function_list {
        &INCOMPLETE_FUNCTION_LIST
    } else {
        &FUNCTION_LIST
    };
    // SAFETY: checked for null above. Callers never write to the table.
    unsafe { *list = table as *const CK_FUNCTION_LIST as CK_FUNCTION_LIST_PTR };
    CKR_OK
}

unsafe extern "C" fn initialize(args: CK_VOID_PTR) -> CK_RV {
    let mut state = STATE.lock();
    state.calls.initialize += 1;
    if state.instances > 0 {
        if !state.behaviour.reinitializable {
            return CKR_CRYPTOKI_ALREADY_INITIALIZED;
        }
        state.instances += 1;
        return CKR_OK;
    }

    // SAFETY: PKCS#11 says this is null or points to initialize args.
    let callbacks = match unsafe { (args as *const CK_C_INITIALIZE_ARGS).as_ref() } {
        Some(args) => {
            state.calls.init_flags = Some(args.flags);
            match (args.CreateMutex, args.DestroyMutex, args.LockMutex, args.UnlockMutex) {
                (Some(create), Some(destroy), Some(lock), Some(unlock)) => Some(MutexCallbacks {
                    create,
                    destroy,
                    lock,
                    unlock,
                }),
                _ => None,
            }
        }
        None => None,
    };
    state.calls.mutex_callbacks = callbacks;

    if state.behaviour.initialize_rv != CKR_OK {
        return state.behaviour.initialize_rv;
    }

    if let Some(callbacks) = callbacks {
        let mut mutex: CK_VOID_PTR = ptr::null_mut();
        // SAFETY: mutex is a valid out param.
        let rv = unsafe { (callbacks.create)(&mut mutex) };
        if rv != CKR_OK {
            return rv;
        }
        state.calls.mutexes_created += 1;
        state.library_mutex = Some(mutex as usize);
    }
    state.instances = 1;
    CKR_OK
}

unsafe extern "C" fn finalize(reserved: CK_VOID_PTR) -> CK_RV {
    let mut state = STATE.lock();
    state.calls.finalize += 1;
    if !reserved.is_null() {
        return CKR_ARGUMENTS_BAD;
    }
    if state.instances == 0 {
        return CKR_CRYPTOKI_NOT_INITIALIZED;
    }
    state.instances -= 1;
    if state.instances > 0 {
        return state.behaviour.finalize_rv;
    }

    if let (Some(callbacks), Some(mutex)) = (state.calls.mutex_callbacks, state.library_mutex.take()) {
        // SAFETY: created in initialize and not locked outside of calls.
        unsafe { (callbacks.destroy)(mutex as CK_VOID_PTR) };
        state.calls.mutexes_destroyed += 1;
    }
    state.sessions.clear();
    state.behaviour.finalize_rv
}

unsafe extern "C" fn get_info(info: CK_INFO_PTR) -> CK_RV {
    let mut state = STATE.lock();
    state.calls.get_info += 1;
    if state.instances == 0 {
        return CKR_CRYPTOKI_NOT_INITIALIZED;
    }
    if state.behaviour.get_info_rv != CKR_OK {
        return state.behaviour.get_info_rv;
    }
    // SAFETY: PKCS#11 requires a valid out param.
    let Some(info) = (unsafe { info.as_mut() }) else {
        return CKR_ARGUMENTS_BAD;
    };

    let (major, minor) = state.behaviour.cryptoki_version;
    info.cryptokiVersion = CK_VERSION { major, minor };
    fill_padded(&mut info.manufacturerID, &state.behaviour.manufacturer);
    info.flags = 0;
    fill_padded(&mut info.libraryDescription, &state.behaviour.description);
    info.libraryVersion = CK_VERSION { major: 1, minor: 0 };
    CKR_OK
}

unsafe extern "C" fn get_slot_list(
    token_present: CK_BBOOL,
    list: CK_SLOT_ID_PTR,
    count: CK_ULONG_PTR,
) -> CK_RV {
    let mut state = STATE.lock();
    state.calls.get_slot_list += 1;
    if state.instances == 0 {
        return CKR_CRYPTOKI_NOT_INITIALIZED;
    }
    // SAFETY: PKCS#11 requires a valid count.
    let Some(count) = (unsafe { count.as_mut() }) else {
        return CKR_ARGUMENTS_BAD;
    };

    let ids: Vec<CK_SLOT_ID> = state
        .behaviour
        .slots
        .iter()
        .filter(|slot| token_present == CK_FALSE || slot.token_label.is_some())
        .map(|slot| slot.id)
        .collect();

    if list.is_null() {
        *count = ids.len() as CK_ULONG;
        return CKR_OK;
    }
    if (*count as usize) < ids.len() {
        *count = ids.len() as CK_ULONG;
        return CKR_BUFFER_TOO_SMALL;
    }
    // SAFETY: the caller provided room for count entries.
    unsafe { slice::from_raw_parts_mut(list, ids.len()) }.copy_from_slice(&ids);
    *count = ids.len() as CK_ULONG;
    CKR_OK
}

unsafe extern "C" fn get_slot_info(slot_id: CK_SLOT_ID, info: CK_SLOT_INFO_PTR) -> CK_RV {
    let state = STATE.lock();
    if state.instances == 0 {
        return CKR_CRYPTOKI_NOT_INITIALIZED;
    }
    let Some(slot) = state.behaviour.slots.iter().find(|slot| slot.id == slot_id) else {
        return CKR_SLOT_ID_INVALID;
    };
    // SAFETY: PKCS#11 requires a valid out param.
    let Some(info) = (unsafe { info.as_mut() }) else {
        return CKR_ARGUMENTS_BAD;
    };

    fill_padded(&mut info.slotDescription, &format!("Mock slot {}", slot.id));
    fill_padded(&mut info.manufacturerID, &state.behaviour.manufacturer);
    info.flags = CKF_HW_SLOT;
    if slot.token_label.is_some() {
        info.flags |= CKF_TOKEN_PRESENT;
    }
    info.hardwareVersion = CK_VERSION { major: 1, minor: 0 };
    info.firmwareVersion = CK_VERSION { major: 2, minor: 5 };
    CKR_OK
}

unsafe extern "C" fn wait_for_slot_event(
    flags: CK_FLAGS,
    slot: CK_SLOT_ID_PTR,
    _reserved: CK_VOID_PTR,
) -> CK_RV {
    let mut state = STATE.lock();
    state.calls.wait_for_slot_event.push(flags);
    if state.instances == 0 {
        return CKR_CRYPTOKI_NOT_INITIALIZED;
    }
    if state.behaviour.wait_for_slot_event_rv != CKR_OK {
        return state.behaviour.wait_for_slot_event_rv;
    }
    // SAFETY: PKCS#11 requires a valid out param.
    let Some(slot) = (unsafe { slot.as_mut() }) else {
        return CKR_ARGUMENTS_BAD;
    };
    *slot = state.behaviour.slot_event;
    CKR_OK
}

unsafe extern "C" fn get_token_info(slot_id: CK_SLOT_ID, info: CK_TOKEN_INFO_PTR) -> CK_RV {
    let state = STATE.lock();
    if state.instances == 0 {
        return CKR_CRYPTOKI_NOT_INITIALIZED;
    }
    let Some(slot) = state.behaviour.slots.iter().find(|slot| slot.id == slot_id) else {
        return CKR_SLOT_ID_INVALID;
    };
    let Some(label) = slot.token_label.as_deref() else {
        return CKR_TOKEN_NOT_PRESENT;
    };
    // SAFETY: PKCS#11 requires a valid out param.
    let Some(info) = (unsafe { info.as_mut() }) else {
        return CKR_ARGUMENTS_BAD;
    };

    fill_padded(&mut info.label, label);
    fill_padded(&mut info.manufacturerID, &state.behaviour.manufacturer);
    fill_padded(&mut info.model, "MockModel");
    fill_padded(&mut info.serialNumber, &format!("{:016}", slot.id));
    info.flags = CKF_LOGIN_REQUIRED | CKF_USER_PIN_INITIALIZED | CKF_TOKEN_INITIALIZED;
    CKR_OK
}

unsafe extern "C" fn open_session(
    slot_id: CK_SLOT_ID,
    flags: CK_FLAGS,
    application: CK_VOID_PTR,
    notify: CK_NOTIFY,
    session: CK_SESSION_HANDLE_PTR,
) -> CK_RV {
    with_library_lock(|state| {
        if state.instances == 0 {
            return CKR_CRYPTOKI_NOT_INITIALIZED;
        }
        state.calls.open_session.push(OpenSessionCall {
            slot_id,
            flags,
            application_null: application.is_null(),
            notify_set: notify.is_some(),
        });
        if !state.behaviour.slots.iter().any(|slot| slot.id == slot_id) {
            return CKR_SLOT_ID_INVALID;
        }
        if flags & CKF_SERIAL_SESSION == 0 {
            return CKR_SESSION_PARALLEL_NOT_SUPPORTED;
        }
        if state.behaviour.open_session_rv != CKR_OK {
            return state.behaviour.open_session_rv;
        }
        // SAFETY: PKCS#11 requires a valid out param.
        let Some(session) = (unsafe { session.as_mut() }) else {
            return CKR_ARGUMENTS_BAD;
        };

        *session = state.next_session;
        state.next_session += 1;
        state.sessions.push(*session);
        CKR_OK
    })
}

unsafe extern "C" fn close_session(session: CK_SESSION_HANDLE) -> CK_RV {
    with_library_lock(|state| {
        state.calls.close_session.push(session);
        if state.behaviour.close_session_rv != CKR_OK {
            return state.behaviour.close_session_rv;
        }
        match state.sessions.iter().position(|&open| open == session) {
            Some(pos) => {
                state.sessions.remove(pos);
                CKR_OK
            }
            None => CKR_SESSION_HANDLE_INVALID,
        }
    })
}

unsafe extern "C" fn login(
    session: CK_SESSION_HANDLE,
    user_type: CK_USER_TYPE,
    pin: CK_UTF8CHAR_PTR,
    pin_len: CK_ULONG,
) -> CK_RV {
    let pin = if pin.is_null() {
        None
    } else {
        // SAFETY: PKCS#11 requires pin to point to pin_len bytes.
        Some(unsafe { slice::from_raw_parts(pin, pin_len as usize) }.to_vec())
    };
    with_library_lock(|state| {
        state.calls.login.push(LoginCall {
            session,
            user_type,
            pin,
            pin_len,
        });
        if !state.sessions.contains(&session) {
            return CKR_SESSION_HANDLE_INVALID;
        }
        state.behaviour.login_rv
    })
}

unsafe extern "C" fn logout(session: CK_SESSION_HANDLE) -> CK_RV {
    with_library_lock(|state| {
        state.calls.logout.push(session);
        state.behaviour.logout_rv
    })
}


//------------ Tests ---------------------------------------------------------
