#![allow(dead_code)] // Different tests use different parts.

use p11bridge::api;
use p11bridge::handle::Handle;
use p11bridge::mock::MockLoader;

pub const MOCK_LIBRARY: &str = "libmock-pkcs11.so";

/// Sends log output to stderr, where the test harness captures it.
pub fn init_logging() {
    let _ = stderrlog::new().verbosity(4).init();
}

/// Loads the installed mock library through the boundary.
pub fn load_mock() -> Handle {
    api::load_module_with(&MockLoader, MOCK_LIBRARY).unwrap()
}

/// Loads the mock library and returns handles for it and its first slot.
pub fn load_mock_with_slot() -> (Handle, Handle) {
    let module = load_mock();
    let slot_id = api::slot_list(module, true).unwrap()[0];
    let slot = api::init_slot(module, slot_id).unwrap();
    (module, slot)
}
