//! Various crate-wide constants.


//------------ Binary Names -------------------------------------------------

/// The friendly name of the `p11probe` binary.
pub const P11_PROBE_APP: &str = "PKCS#11 Module Probe";


//------------ Config Files Paths -------------------------------------------

/// The default path to the config file.
pub const P11BRIDGE_DEFAULT_CONFIG_FILE: &str = "/etc/p11bridge.conf";


//------------ Environment Variables ----------------------------------------

/// The environment variable with the log level.
///
/// The variable should contain the name of a [`log::LevelFilter`]. It will
/// be overwritten by the config file. The default is “info.”
pub const P11BRIDGE_ENV_LOG_LEVEL: &str = "P11BRIDGE_LOG_LEVEL";

/// The environment variable with the user PIN.
///
/// Used when the config file does not contain a `user_pin`.
pub const P11BRIDGE_ENV_USER_PIN: &str = "P11BRIDGE_USER_PIN";


//------------ PKCS#11 ------------------------------------------------------

/// The one symbol every PKCS#11 library must export.
pub const PKCS11_ENTRY_POINT: &str = "C_GetFunctionList";


//------------ Handle Magic -------------------------------------------------

/// The magic tag carried by every module handle.
pub const MODULE_HANDLE_MAGIC: u16 = 0x4d31;

/// The magic tag carried by every slot handle.
pub const SLOT_HANDLE_MAGIC: u16 = 0x5331;
