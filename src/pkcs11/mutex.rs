//! Mutex callbacks handed to a PKCS#11 library.
//!
//! `C_Initialize` accepts four callbacks which the library uses to protect
//! its own internal state when it is called from several threads at once.
//! The library treats the mutexes as opaque pointers; here they point at a
//! heap allocated [`parking_lot::RawMutex`], which works the same on every
//! platform so no conditional code is needed.

use std::alloc::{self, Layout};
use std::ptr;

use cryptoki_sys::{
    CK_C_INITIALIZE_ARGS, CK_RV, CK_VOID_PTR, CK_VOID_PTR_PTR, CKF_OS_LOCKING_OK,
    CKR_ARGUMENTS_BAD, CKR_HOST_MEMORY, CKR_MUTEX_NOT_LOCKED, CKR_OK,
};
use parking_lot::RawMutex;
use parking_lot::lock_api::RawMutex as _;

/// Allocates and initializes a new mutex, storing it in `*pp_mutex`.
///
/// # Safety
///
/// `pp_mutex` must be null or valid for writing a pointer.
pub unsafe extern "C" fn create_mutex(pp_mutex: CK_VOID_PTR_PTR) -> CK_RV {
    if pp_mutex.is_null() {
        return CKR_ARGUMENTS_BAD;
    }

    let layout = Layout::new::<RawMutex>();
    // SAFETY: RawMutex is not zero sized.
    let mutex = unsafe { alloc::alloc(layout) } as *mut RawMutex;
    if mutex.is_null() {
        return CKR_HOST_MEMORY;
    }

    // SAFETY: mutex is non-null, aligned and sized for a RawMutex and the
    // caller guarantees pp_mutex can be written.
    unsafe {
        mutex.write(RawMutex::INIT);
        *pp_mutex = mutex as CK_VOID_PTR;
    }
    CKR_OK
}

/// Releases a mutex created by [`create_mutex`].
///
/// # Safety
///
/// `p_mutex` must be null or a pointer returned by `create_mutex` that has
/// not been destroyed yet and is not locked.
pub unsafe extern "C" fn destroy_mutex(p_mutex: CK_VOID_PTR) -> CK_RV {
    if p_mutex.is_null() {
        return CKR_ARGUMENTS_BAD;
    }

    // SAFETY: allocated in create_mutex with the global allocator and the
    // layout of RawMutex, which is what Box uses.
    drop(unsafe { Box::from_raw(p_mutex as *mut RawMutex) });
    CKR_OK
}

/// Blocks until the mutex is acquired.
///
/// # Safety
///
/// `p_mutex` must be null or a live pointer returned by `create_mutex`.
pub unsafe extern "C" fn lock_mutex(p_mutex: CK_VOID_PTR) -> CK_RV {
    if p_mutex.is_null() {
        return CKR_ARGUMENTS_BAD;
    }

    // SAFETY: see the function contract.
    let mutex = unsafe { &*(p_mutex as *const RawMutex) };
    mutex.lock();
    CKR_OK
}

/// Releases the mutex.
///
/// # Safety
///
/// `p_mutex` must be null or a live pointer returned by `create_mutex`.
/// The mutex must have been locked by the caller's context.
pub unsafe extern "C" fn unlock_mutex(p_mutex: CK_VOID_PTR) -> CK_RV {
    if p_mutex.is_null() {
        return CKR_ARGUMENTS_BAD;
    }

    // SAFETY: see the function contract.
    let mutex = unsafe { &*(p_mutex as *const RawMutex) };
    if !mutex.is_locked() {
        return CKR_MUTEX_NOT_LOCKED;
    }

    // SAFETY: the mutex is locked and PKCS#11 requires that the thread
    // unlocking it is the one that locked it.
    unsafe { mutex.unlock() };
    CKR_OK
}

/// Returns the arguments to pass to `C_Initialize`.
///
/// The library is given our mutex callbacks and told that it may also use
/// native operating system locking if it prefers.
pub fn initialize_args() -> CK_C_INITIALIZE_ARGS {
    CK_C_INITIALIZE_ARGS {
        CreateMutex: Some(create_mutex),
        DestroyMutex: Some(destroy_mutex),
        LockMutex: Some(lock_mutex),
        UnlockMutex: Some(unlock_mutex),
        flags: CKF_OS_LOCKING_OK,
        pReserved: ptr::null_mut(),
    }
}


//------------ Tests ---------------------------------------------------------
