//! Slots and tokens.

use std::mem;
use std::ptr;
use std::thread;
use std::time::Duration;

use cryptoki_sys::*;
use log::{debug, info};

use crate::error::{Error, Result};
use crate::handle::Handle;
use crate::pkcs11::module::{Pkcs11Module, Version};
use crate::pkcs11::util::{has_flag, padded_str};

/// How often the slot list is fetched again when it grows in between the
/// two calls to `C_GetSlotList`.
const SLOT_LIST_ATTEMPTS: usize = 3;

/// How long to wait between looking for a token when the library cannot
/// report slot events.
pub const SLOT_POLL_INTERVAL: Duration = Duration::from_secs(1);


//------------ Slot ----------------------------------------------------------

/// A slot of a particular module.
///
/// This is what a slot handle refers to.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Slot {
    id: CK_SLOT_ID,
    module: Handle,
}

impl Slot {
    pub fn new(id: CK_SLOT_ID, module: Handle) -> Self {
        Slot { id, module }
    }

    pub fn id(&self) -> CK_SLOT_ID {
        self.id
    }

    /// Returns the handle of the module the slot belongs to.
    pub fn module(&self) -> Handle {
        self.module
    }
}


//------------ SlotInfo ------------------------------------------------------

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SlotInfo {
    pub id: CK_SLOT_ID,
    pub description: String,
    pub manufacturer: String,
    pub token_present: bool,
    pub removable_device: bool,
    pub hardware_slot: bool,
    pub hardware_version: Version,
    pub firmware_version: Version,
}

impl SlotInfo {
    fn from_raw(id: CK_SLOT_ID, info: &CK_SLOT_INFO) -> Self {
        SlotInfo {
            id,
            description: padded_str(&info.slotDescription),
            manufacturer: padded_str(&info.manufacturerID),
            token_present: has_flag(info.flags, CKF_TOKEN_PRESENT),
            removable_device: has_flag(info.flags, CKF_REMOVABLE_DEVICE),
            hardware_slot: has_flag(info.flags, CKF_HW_SLOT),
            hardware_version: info.hardwareVersion.into(),
            firmware_version: info.firmwareVersion.into(),
        }
    }
}


//------------ TokenInfo -----------------------------------------------------

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TokenInfo {
    pub label: String,
    pub manufacturer: String,
    pub model: String,
    pub serial_number: String,
    pub login_required: bool,
    pub protected_authentication_path: bool,
    pub token_initialized: bool,
}

impl From<&CK_TOKEN_INFO> for TokenInfo {
    fn from(info: &CK_TOKEN_INFO) -> Self {
        TokenInfo {
            label: padded_str(&info.label),
            manufacturer: padded_str(&info.manufacturerID),
            model: padded_str(&info.model),
            serial_number: padded_str(&info.serialNumber),
            login_required: has_flag(info.flags, CKF_LOGIN_REQUIRED),
            protected_authentication_path: has_flag(info.flags, CKF_PROTECTED_AUTHENTICATION_PATH),
            token_initialized: has_flag(info.flags, CKF_TOKEN_INITIALIZED),
        }
    }
}


//------------ Pkcs11Module: Slots -------------------------------------------

impl Pkcs11Module {
    /// Returns the ids of the module's slots.
    ///
    /// If `token_present` is true, only slots with a token are included.
    pub fn slot_list(&self, token_present: bool) -> Result<Vec<CK_SLOT_ID>> {
        let get_slot_list = self
            .functions()
            .get_slot_list
            .ok_or_else(|| self.not_supported("C_GetSlotList"))?;
        let token_present = if token_present { CK_TRUE } else { CK_FALSE };

        for _ in 0..SLOT_LIST_ATTEMPTS {
            let mut count: CK_ULONG = 0;
            // SAFETY: a null list asks only for the count.
            let rv = unsafe { get_slot_list(token_present, ptr::null_mut(), &mut count) };
            if rv != CKR_OK {
                return Err(self.failed("C_GetSlotList", rv));
            }

            let mut slots: Vec<CK_SLOT_ID> = vec![0; count as usize];
            // SAFETY: slots has room for count entries.
            let rv = unsafe { get_slot_list(token_present, slots.as_mut_ptr(), &mut count) };
            match rv {
                CKR_OK => {
                    slots.truncate(count as usize);
                    return Ok(slots);
                }
                CKR_BUFFER_TOO_SMALL => {
                    debug!("Slot list of PKCS#11 module {} grew, fetching it again", self.name());
                }
                rv => return Err(self.failed("C_GetSlotList", rv)),
            }
        }
        Err(self.failed("C_GetSlotList", CKR_BUFFER_TOO_SMALL))
    }

    pub fn slot_info(&self, slot_id: CK_SLOT_ID) -> Result<SlotInfo> {
        let get_slot_info = self
            .functions()
            .get_slot_info
            .ok_or_else(|| self.not_supported("C_GetSlotInfo"))?;

        // SAFETY: CK_SLOT_INFO is plain data for which all zeroes is valid.
        let mut info: CK_SLOT_INFO = unsafe { mem::zeroed() };
        // SAFETY: info is a valid out param.
        let rv = unsafe { get_slot_info(slot_id, &mut info) };
        if rv != CKR_OK {
            return Err(Error::coded(
                rv,
                format!("C_GetSlotInfo for PKCS#11 slot {} failed", slot_id),
            ));
        }
        Ok(SlotInfo::from_raw(slot_id, &info))
    }

    pub fn token_info(&self, slot_id: CK_SLOT_ID) -> Result<TokenInfo> {
        let get_token_info = self
            .functions()
            .get_token_info
            .ok_or_else(|| self.not_supported("C_GetTokenInfo"))?;

        // SAFETY: CK_TOKEN_INFO is plain data for which all zeroes is valid.
        let mut info: CK_TOKEN_INFO = unsafe { mem::zeroed() };
        // SAFETY: info is a valid out param.
        let rv = unsafe { get_token_info(slot_id, &mut info) };
        if rv != CKR_OK {
            return Err(Error::coded(
                rv,
                format!("C_GetTokenInfo for PKCS#11 slot {} failed", slot_id),
            ));
        }
        Ok(TokenInfo::from(&info))
    }

    /// Finds the first slot holding a token with the given label.
    pub fn find_slot_by_label(&self, label: &str) -> Result<Option<CK_SLOT_ID>> {
        for slot_id in self.slot_list(true)? {
            match self.token_info(slot_id) {
                Ok(info) if info.label == label => return Ok(Some(slot_id)),
                Ok(_) => {}
                // The token may have been removed since the slot was listed.
                Err(err) if err.code() == Some(CKR_TOKEN_NOT_PRESENT) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(None)
    }

    /// Blocks until a slot event happens and returns the slot it happened in.
    ///
    /// Libraries that cannot report slot events are instead asked for their
    /// slot list every [`SLOT_POLL_INTERVAL`] until a slot holds a token.
    pub fn wait_for_slot(&self) -> Result<CK_SLOT_ID> {
        self.wait_for_slot_every(SLOT_POLL_INTERVAL)
    }

    pub(crate) fn wait_for_slot_every(&self, interval: Duration) -> Result<CK_SLOT_ID> {
        if let Some(wait_for_slot_event) = self.functions().wait_for_slot_event {
            let mut slot_id: CK_SLOT_ID = 0;
            // SAFETY: slot_id is a valid out param and the reserved
            // argument must be null.
            let rv = unsafe { wait_for_slot_event(0, &mut slot_id, ptr::null_mut()) };
            match rv {
                CKR_OK => {
                    debug!("Slot event in PKCS#11 slot {} of {}", slot_id, self.name());
                    return Ok(slot_id);
                }
                CKR_FUNCTION_NOT_SUPPORTED => {}
                rv => return Err(self.failed("C_WaitForSlotEvent", rv)),
            }
        }

        info!(
            "PKCS#11 module {} cannot report slot events, polling for a token",
            self.name()
        );
        loop {
            thread::sleep(interval);
            if let Some(slot_id) = self.slot_list(true)?.first() {
                debug!("Found token in PKCS#11 slot {} of {}", slot_id, self.name());
                return Ok(*slot_id);
            }
        }
    }

    fn not_supported(&self, function: &str) -> Error {
        Error::coded(
            CKR_FUNCTION_NOT_SUPPORTED,
            format!("PKCS#11 module {} does not provide {}", self.name(), function),
        )
    }

    fn failed(&self, function: &str, rv: CK_RV) -> Error {
        Error::coded(rv, format!("{} in PKCS#11 module {} failed", function, self.name()))
    }
}


//------------ Tests ---------------------------------------------------------
