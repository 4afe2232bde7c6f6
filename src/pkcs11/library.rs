//! Dynamic library loading.
//!
//! A PKCS#11 module is a shared library exporting a single entry point,
//! `C_GetFunctionList`. This module abstracts opening such a library and
//! looking up that entry point behind the [`LibraryLoader`] and
//! [`LoadedLibrary`] traits so that the module lifecycle can be driven by
//! something other than the operating system loader. Closing a library is
//! done by dropping it.

use std::fmt;
use std::path::Path;

use cryptoki_sys::{CK_FUNCTION_LIST_PTR_PTR, CK_RV};
use log::debug;
use parking_lot::Mutex;

/// The signature of `C_GetFunctionList`.
pub type GetFunctionListFn = unsafe extern "C" fn(CK_FUNCTION_LIST_PTR_PTR) -> CK_RV;


//------------ LibraryLoader -------------------------------------------------

/// Opens libraries.
pub trait LibraryLoader {
    /// Opens the library at `path`.
    ///
    /// On failure the loader's diagnostic message is returned.
    fn open(&self, path: &Path) -> Result<Box<dyn LoadedLibrary>, String>;
}

/// An open library.
///
/// The library stays mapped for as long as the value lives.
pub trait LoadedLibrary: fmt::Debug + Send + Sync {
    /// Looks up an entry point with the `C_GetFunctionList` signature.
    fn function_list_entry(&self, symbol: &str) -> Result<GetFunctionListFn, String>;
}


//------------ SharedLibraryLoader -------------------------------------------

/// Loads libraries through the platform loader.
#[derive(Clone, Copy, Debug, Default)]
pub struct SharedLibraryLoader;

impl LibraryLoader for SharedLibraryLoader {
    fn open(&self, path: &Path) -> Result<Box<dyn LoadedLibrary>, String> {
        // SAFETY: loading a library runs its initialisation routines. We
        // have to trust the PKCS#11 library the operator configured.
        let library = unsafe { libloading::Library::new(path) }.map_err(|err| err.to_string())?;
        Ok(Box::new(SharedLibrary { library }))
    }
}

struct SharedLibrary {
    library: libloading::Library,
}

impl fmt::Debug for SharedLibrary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedLibrary").finish()
    }
}

impl LoadedLibrary for SharedLibrary {
    fn function_list_entry(&self, symbol: &str) -> Result<GetFunctionListFn, String> {
        // SAFETY: PKCS#11 fixes the signature of the symbol. The returned
        // function pointer must not outlive the library, which the module
        // guarantees by keeping both together.
        unsafe {
            self.library
                .get::<GetFunctionListFn>(symbol.as_bytes())
                .map(|sym| *sym)
                .map_err(|err| err.to_string())
        }
    }
}


//------------ LoaderSubsystem -----------------------------------------------

/// The number of live references to the dynamic loading subsystem.
static SUBSYSTEM_REFS: Mutex<usize> = parking_lot::const_mutex(0);

/// A reference to the process wide dynamic loading subsystem.
///
/// The subsystem is initialized when the first reference is taken and torn
/// down when the last one is dropped. Every module holds one reference for
/// its whole lifetime, and a load attempt holds one until it either succeeds
/// or has unwound.
#[derive(Debug)]
pub struct LoaderSubsystem {
    _private: (),
}

impl LoaderSubsystem {
    pub fn acquire() -> Self {
        let mut refs = SUBSYSTEM_REFS.lock();
        if *refs == 0 {
            debug!("Initializing dynamic library loading");
        }
        *refs += 1;
        LoaderSubsystem { _private: () }
    }

    /// Returns the number of live references.
    pub fn references() -> usize {
        *SUBSYSTEM_REFS.lock()
    }
}

impl Drop for LoaderSubsystem {
    fn drop(&mut self) {
        let mut refs = SUBSYSTEM_REFS.lock();
        *refs -= 1;
        if *refs == 0 {
            debug!("Shutting down dynamic library loading");
        }
    }
}


//------------ Tests ---------------------------------------------------------
