//! Talking to PKCS#11 libraries.

pub mod library;
pub mod module;
pub mod mutex;
pub mod session;
pub mod slot;
pub mod util;

pub use self::module::{ModuleInfo, Pkcs11Module, Version};
pub use self::session::{SessionInfo, SessionState, UserType};
pub use self::slot::{Slot, SlotInfo, TokenInfo};
