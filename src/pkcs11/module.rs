//! A loaded and initialized PKCS#11 library.

use std::fmt;
use std::mem;
use std::path::Path;
use std::ptr;

use cryptoki_sys::*;
use log::{debug, error, info, warn};

use crate::constants::PKCS11_ENTRY_POINT;
use crate::error::{Error, Result};
use crate::pkcs11::library::{LibraryLoader, LoadedLibrary, LoaderSubsystem, SharedLibraryLoader};
use crate::pkcs11::mutex;
use crate::pkcs11::session::SessionTable;
use crate::pkcs11::util::padded_str;


//------------ Functions -----------------------------------------------------

type InitializeFn = unsafe extern "C" fn(CK_VOID_PTR) -> CK_RV;
type FinalizeFn = unsafe extern "C" fn(CK_VOID_PTR) -> CK_RV;
type GetInfoFn = unsafe extern "C" fn(CK_INFO_PTR) -> CK_RV;
type GetSlotListFn = unsafe extern "C" fn(CK_BBOOL, CK_SLOT_ID_PTR, CK_ULONG_PTR) -> CK_RV;
type GetSlotInfoFn = unsafe extern "C" fn(CK_SLOT_ID, CK_SLOT_INFO_PTR) -> CK_RV;
type GetTokenInfoFn = unsafe extern "C" fn(CK_SLOT_ID, CK_TOKEN_INFO_PTR) -> CK_RV;
type WaitForSlotEventFn = unsafe extern "C" fn(CK_FLAGS, CK_SLOT_ID_PTR, CK_VOID_PTR) -> CK_RV;
type OpenSessionFn = unsafe extern "C" fn(
    CK_SLOT_ID,
    CK_FLAGS,
    CK_VOID_PTR,
    CK_NOTIFY,
    CK_SESSION_HANDLE_PTR,
) -> CK_RV;
type CloseSessionFn = unsafe extern "C" fn(CK_SESSION_HANDLE) -> CK_RV;
type LoginFn = unsafe extern "C" fn(CK_SESSION_HANDLE, CK_USER_TYPE, CK_UTF8CHAR_PTR, CK_ULONG) -> CK_RV;
type LogoutFn = unsafe extern "C" fn(CK_SESSION_HANDLE) -> CK_RV;

/// The subset of the library's function list we use.
///
/// The pointers are copied out of the list returned by `C_GetFunctionList`
/// so that the functions every module must provide need not be checked on
/// each call. They are only valid while the library is loaded.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Functions {
    pub initialize: InitializeFn,
    pub finalize: FinalizeFn,
    pub get_info: GetInfoFn,
    pub open_session: OpenSessionFn,
    pub close_session: CloseSessionFn,
    pub login: LoginFn,
    pub logout: LogoutFn,

    pub get_slot_list: Option<GetSlotListFn>,
    pub get_slot_info: Option<GetSlotInfoFn>,
    pub get_token_info: Option<GetTokenInfoFn>,
    pub wait_for_slot_event: Option<WaitForSlotEventFn>,
}

impl Functions {
    fn from_list(list: &CK_FUNCTION_LIST) -> std::result::Result<Self, &'static str> {
        Ok(Functions {
            initialize: list.C_Initialize.ok_or("C_Initialize")?,
            finalize: list.C_Finalize.ok_or("C_Finalize")?,
            get_info: list.C_GetInfo.ok_or("C_GetInfo")?,
            open_session: list.C_OpenSession.ok_or("C_OpenSession")?,
            close_session: list.C_CloseSession.ok_or("C_CloseSession")?,
            login: list.C_Login.ok_or("C_Login")?,
            logout: list.C_Logout.ok_or("C_Logout")?,
            get_slot_list: list.C_GetSlotList,
            get_slot_info: list.C_GetSlotInfo,
            get_token_info: list.C_GetTokenInfo,
            wait_for_slot_event: list.C_WaitForSlotEvent,
        })
    }
}


//------------ Version -------------------------------------------------------

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
}

impl From<CK_VERSION> for Version {
    fn from(version: CK_VERSION) -> Self {
        Version {
            major: version.major,
            minor: version.minor,
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{:02}", self.major, self.minor)
    }
}


//------------ ModuleInfo ----------------------------------------------------

/// What a library reports about itself through `C_GetInfo`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ModuleInfo {
    pub cryptoki_version: Version,
    pub manufacturer: String,
    pub flags: CK_FLAGS,
    pub description: String,
    pub library_version: Version,
}

impl From<&CK_INFO> for ModuleInfo {
    fn from(info: &CK_INFO) -> Self {
        ModuleInfo {
            cryptoki_version: info.cryptokiVersion.into(),
            manufacturer: padded_str(&info.manufacturerID),
            flags: info.flags,
            description: padded_str(&info.libraryDescription),
            library_version: info.libraryVersion.into(),
        }
    }
}

impl fmt::Display for ModuleInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "cryptoki {}, manufacturer '{}', description '{}', library version {}",
            self.cryptoki_version, self.manufacturer, self.description, self.library_version
        )
    }
}


//------------ Pkcs11Module --------------------------------------------------

/// A loaded PKCS#11 library.
///
/// Exactly one `C_Initialize` is made when the module is loaded and exactly
/// one `C_Finalize` when it is dropped, after which the library is closed.
/// The function table and library never change in between so a module can
/// be shared freely between threads; the library serializes its own state
/// through the mutex callbacks it was initialized with.
#[derive(Debug)]
pub struct Pkcs11Module {
    name: String,

    functions: Functions,

    info: ModuleInfo,

    sessions: SessionTable,

    // Dropped after the fields above, and in this order: the library must
    // be closed before the subsystem reference is released.
    library: Box<dyn LoadedLibrary>,
    _subsystem: LoaderSubsystem,
}

impl Pkcs11Module {
    /// Loads and initializes the library at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        Self::load_with(&SharedLibraryLoader, path)
    }

    /// Loads and initializes a library using the given loader.
    ///
    /// If any step fails, everything done so far is undone before the error
    /// is returned.
    pub fn load_with(loader: &dyn LibraryLoader, path: &Path) -> Result<Self> {
        let subsystem = LoaderSubsystem::acquire();
        let name = path.to_string_lossy().to_string();

        let library = loader.open(path).map_err(|reason| {
            error!("Cannot open PKCS#11 module {}: {}", name, reason);
            Error::module_load(&name, reason)
        })?;

        let get_function_list = library
            .function_list_entry(PKCS11_ENTRY_POINT)
            .map_err(|reason| {
                error!("Cannot find {} in PKCS#11 module {}: {}", PKCS11_ENTRY_POINT, name, reason);
                Error::MissingEntryPoint {
                    module: name.clone(),
                    symbol: PKCS11_ENTRY_POINT,
                }
            })?;

        let mut list: CK_FUNCTION_LIST_PTR = ptr::null_mut();
        // SAFETY: the entry point has the C_GetFunctionList signature.
        let rv = unsafe { get_function_list(&mut list) };
        if rv != CKR_OK {
            return Err(Error::coded(
                rv,
                format!("C_GetFunctionList in PKCS#11 module {} failed", name),
            ));
        }

        // SAFETY: on success the library hands out a pointer to its function
        // list, which stays valid while the library is loaded.
        let functions = match unsafe { list.as_ref() } {
            Some(list) => Functions::from_list(list).map_err(|missing| {
                Error::module_load(&name, format!("function {} is not provided", missing))
            })?,
            None => return Err(Error::module_load(&name, "C_GetFunctionList returned no function list")),
        };

        let mut args = mutex::initialize_args();
        // SAFETY: args lives until the call returns and the library must not
        // keep a reference to it.
        let rv = unsafe { (functions.initialize)(&mut args as *mut CK_C_INITIALIZE_ARGS as CK_VOID_PTR) };
        if rv != CKR_OK {
            return Err(Error::coded(
                rv,
                format!("C_Initialize in PKCS#11 module {} failed", name),
            ));
        }

        // SAFETY: CK_INFO is plain data for which all zeroes is valid.
        let mut ck_info: CK_INFO = unsafe { mem::zeroed() };
        // SAFETY: the library was initialized above.
        let rv = unsafe { (functions.get_info)(&mut ck_info) };
        if rv != CKR_OK {
            // The library was initialized, so it must be finalized too.
            // SAFETY: reserved argument must be null.
            unsafe { (functions.finalize)(ptr::null_mut()) };
            return Err(Error::coded(
                rv,
                format!("C_GetInfo in PKCS#11 module {} failed", name),
            ));
        }
        let info = ModuleInfo::from(&ck_info);

        info!("Loaded PKCS#11 module {}: {}", name, info);

        Ok(Pkcs11Module {
            name,
            functions,
            info,
            sessions: SessionTable::default(),
            library,
            _subsystem: subsystem,
        })
    }

    /// Returns the path the module was loaded from.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn info(&self) -> &ModuleInfo {
        &self.info
    }

    pub(crate) fn functions(&self) -> &Functions {
        &self.functions
    }

    pub(crate) fn sessions(&self) -> &SessionTable {
        &self.sessions
    }
}

impl Drop for Pkcs11Module {
    fn drop(&mut self) {
        let open = self.sessions.len();
        if open > 0 {
            debug!("Unloading PKCS#11 module {} with {} open session(s)", self.name, open);
        }

        // SAFETY: the library is still loaded, it is closed when the
        // library field is dropped after this.
        let rv = unsafe { (self.functions.finalize)(ptr::null_mut()) };
        if rv != CKR_OK {
            warn!(
                "C_Finalize in PKCS#11 module {} failed: {}",
                self.name,
                crate::pkcs11::util::rv_name(rv)
            );
        }
        info!("Unloaded PKCS#11 module {}", self.name);
    }
}


//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::mock::{self, MockBehaviour, MockLoader};

    fn load() -> Result<Pkcs11Module> {
        Pkcs11Module::load_with(&MockLoader, Path::new("libmock-pkcs11.so"))
    }

    #[test]
    fn load_caches_library_info() {
        let mock = mock::install(MockBehaviour::default());
        let module = load().unwrap();

        assert_eq!(module.name(), "libmock-pkcs11.so");
        assert_eq!(module.info().cryptoki_version, Version { major: 2, minor: 20 });
        assert_eq!(module.info().manufacturer, "TestCA");
        assert_eq!(module.info().description, "MockToken");

        let calls = mock.calls();
        assert_eq!(calls.initialize, 1);
        assert_eq!(calls.get_info, 1);
        assert_eq!(calls.init_flags, Some(CKF_OS_LOCKING_OK));
        assert!(calls.mutex_callbacks.is_some());
    }

    #[test]
    fn drop_finalizes_then_closes() {
        let mock = mock::install(MockBehaviour::default());
        let before = LoaderSubsystem::references();
        let module = load().unwrap();
        assert_eq!(LoaderSubsystem::references(), before + 1);
        drop(module);

        let calls = mock.calls();
        assert_eq!(calls.finalize, 1);
        assert_eq!(calls.libraries_opened, 1);
        assert_eq!(calls.libraries_closed, 1);
        assert_eq!(calls.mutexes_created, calls.mutexes_destroyed);
        assert_eq!(LoaderSubsystem::references(), before);
    }

    #[test]
    fn failed_open_reports_loader_diagnostic() {
        let mock = mock::install(MockBehaviour {
            openable: false,
            ..Default::default()
        });
        let before = LoaderSubsystem::references();
        let err = load().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ModuleLoad);
        assert!(err.to_string().contains("No such file"));
        assert_eq!(mock.calls().libraries_opened, 0);
        assert_eq!(LoaderSubsystem::references(), before);
    }

    #[test]
    fn missing_entry_point_closes_library() {
        let mock = mock::install(MockBehaviour {
            export_entry_point: false,
            ..Default::default()
        });
        let err = load().unwrap_err();
        assert!(matches!(err, Error::MissingEntryPoint { .. }));

        let calls = mock.calls();
        assert_eq!(calls.libraries_opened, 1);
        assert_eq!(calls.libraries_closed, 1);
        assert_eq!(calls.initialize, 0);
    }

    #[test]
    fn failing_get_function_list_is_coded() {
        let mock = mock::install(MockBehaviour {
            get_function_list_rv: CKR_HOST_MEMORY,
            ..Default::default()
        });
        let err = load().unwrap_err();
        assert_eq!(err.code(), Some(CKR_HOST_MEMORY));
        assert_eq!(mock.calls().libraries_closed, 1);
    }

    #[test]
    fn incomplete_function_list_is_rejected() {
        let mock = mock::install(MockBehaviour {
            incomplete_function_list: true,
            ..Default::default()
        });
        let err = load().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ModuleLoad);
        assert!(err.to_string().contains("C_Login"));
        assert_eq!(mock.calls().initialize, 0);
    }

    #[test]
    fn failing_initialize_is_coded_and_unwinds() {
        let mock = mock::install(MockBehaviour {
            initialize_rv: CKR_CANT_LOCK,
            ..Default::default()
        });
        let before = LoaderSubsystem::references();
        let err = load().unwrap_err();
        assert_eq!(err.code(), Some(CKR_CANT_LOCK));
        assert!(err.to_string().contains("C_Initialize"));

        let calls = mock.calls();
        assert_eq!(calls.finalize, 0);
        assert_eq!(calls.libraries_closed, 1);
        assert_eq!(LoaderSubsystem::references(), before);
    }

    #[test]
    fn failing_get_info_finalizes() {
        let mock = mock::install(MockBehaviour {
            get_info_rv: CKR_DEVICE_ERROR,
            ..Default::default()
        });
        let err = load().unwrap_err();
        assert_eq!(err.code(), Some(CKR_DEVICE_ERROR));

        let calls = mock.calls();
        assert_eq!(calls.initialize, 1);
        assert_eq!(calls.finalize, 1);
        assert_eq!(calls.libraries_closed, 1);
        assert_eq!(calls.mutexes_created, calls.mutexes_destroyed);
    }

    #[test]
    fn failing_finalize_is_not_fatal() {
        let mock = mock::install(MockBehaviour {
            finalize_rv: CKR_GENERAL_ERROR,
            ..Default::default()
        });
        drop(load().unwrap());
        assert_eq!(mock.calls().finalize, 1);
        assert_eq!(mock.calls().libraries_closed, 1);
    }

    #[test]
    fn version_display() {
        assert_eq!(Version { major: 2, minor: 20 }.to_string(), "2.20");
        assert_eq!(Version { major: 2, minor: 1 }.to_string(), "2.01");
    }
}
