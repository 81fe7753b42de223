//! SETTINGS parameter table.
//!
//! One side's advertised parameters. Presence is tracked separately from the
//! value so that "explicitly 0" and "never sent" stay distinguishable, which
//! matters for `merge` (only ids the peer actually sent overwrite ours).

use crate::error::{Error, Result};
use crate::h2::frame::{ErrorCode, DEFAULT_MAX_FRAME_SIZE, MAX_MAX_FRAME_SIZE, MAX_WINDOW_SIZE};

/// Initial flow-control window before any SETTINGS are exchanged.
pub const DEFAULT_INITIAL_WINDOW_SIZE: u32 = 65535;

/// Default HPACK dynamic table size.
pub const DEFAULT_HEADER_TABLE_SIZE: u32 = 4096;

/// SETTINGS parameter identifiers per RFC 9113 Section 6.5.2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum SettingsId {
    HeaderTableSize = 0x1,
    EnablePush = 0x2,
    MaxConcurrentStreams = 0x3,
    InitialWindowSize = 0x4,
    MaxFrameSize = 0x5,
    MaxHeaderListSize = 0x6,
}

impl SettingsId {
    /// All known ids, in wire order.
    pub const ALL: [SettingsId; 6] = [
        Self::HeaderTableSize,
        Self::EnablePush,
        Self::MaxConcurrentStreams,
        Self::InitialWindowSize,
        Self::MaxFrameSize,
        Self::MaxHeaderListSize,
    ];

    /// Map a wire id. Unknown ids return None and must be ignored.
    pub fn from_u16(id: u16) -> Option<Self> {
        match id {
            0x1 => Some(Self::HeaderTableSize),
            0x2 => Some(Self::EnablePush),
            0x3 => Some(Self::MaxConcurrentStreams),
            0x4 => Some(Self::InitialWindowSize),
            0x5 => Some(Self::MaxFrameSize),
            0x6 => Some(Self::MaxHeaderListSize),
            _ => None,
        }
    }

    fn slot(self) -> usize {
        self as usize - 1
    }
}

impl From<SettingsId> for u16 {
    fn from(id: SettingsId) -> u16 {
        id as u16
    }
}

/// Sparse SETTINGS table with presence bits.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Settings {
    present: u8,
    values: [u32; 6],
}

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a parameter. Returns `&mut Self` for chaining.
    pub fn set(&mut self, id: SettingsId, value: u32) -> &mut Self {
        let slot = id.slot();
        self.present |= 1 << slot;
        self.values[slot] = value;
        self
    }

    /// Set by raw wire id. Unknown ids are ignored; duplicates keep the last value.
    pub fn set_raw(&mut self, id: u16, value: u32) {
        if let Some(id) = SettingsId::from_u16(id) {
            self.set(id, value);
        }
    }

    pub fn get(&self, id: SettingsId) -> Option<u32> {
        if self.is_set(id) {
            Some(self.values[id.slot()])
        } else {
            None
        }
    }

    pub fn is_set(&self, id: SettingsId) -> bool {
        self.present & (1 << id.slot()) != 0
    }

    /// Remove every parameter.
    pub fn clear(&mut self) {
        self.present = 0;
        self.values = [0; 6];
    }

    /// Number of parameters that are set.
    pub fn len(&self) -> usize {
        self.present.count_ones() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.present == 0
    }

    /// Iterate over the set parameters in wire order.
    pub fn iter(&self) -> impl Iterator<Item = (SettingsId, u32)> + '_ {
        SettingsId::ALL
            .iter()
            .filter_map(move |&id| self.get(id).map(|value| (id, value)))
    }

    /// Overlay every parameter present in `other`.
    pub fn merge(&mut self, other: &Settings) {
        for (id, value) in other.iter() {
            self.set(id, value);
        }
    }

    pub fn header_table_size(&self) -> u32 {
        self.get(SettingsId::HeaderTableSize)
            .unwrap_or(DEFAULT_HEADER_TABLE_SIZE)
    }

    pub fn enable_push(&self, default: bool) -> bool {
        self.get(SettingsId::EnablePush)
            .map(|v| v == 1)
            .unwrap_or(default)
    }

    pub fn max_concurrent_streams(&self, default: u32) -> u32 {
        self.get(SettingsId::MaxConcurrentStreams).unwrap_or(default)
    }

    pub fn initial_window_size(&self) -> u32 {
        self.get(SettingsId::InitialWindowSize)
            .unwrap_or(DEFAULT_INITIAL_WINDOW_SIZE)
    }

    pub fn max_frame_size(&self, default: u32) -> u32 {
        self.get(SettingsId::MaxFrameSize).unwrap_or(default)
    }

    pub fn max_header_list_size(&self, default: u32) -> u32 {
        self.get(SettingsId::MaxHeaderListSize).unwrap_or(default)
    }

    /// Check every present value against RFC 9113 Section 6.5.2.
    ///
    /// Violations are connection errors; nothing is clamped.
    pub fn validate(&self) -> Result<()> {
        if let Some(push) = self.get(SettingsId::EnablePush) {
            if push > 1 {
                return Err(Error::protocol(
                    ErrorCode::ProtocolError,
                    format!("SETTINGS_ENABLE_PUSH must be 0 or 1, got {}", push),
                ));
            }
        }
        if let Some(window) = self.get(SettingsId::InitialWindowSize) {
            if window > MAX_WINDOW_SIZE {
                return Err(Error::protocol(
                    ErrorCode::FlowControlError,
                    format!("SETTINGS_INITIAL_WINDOW_SIZE {} exceeds 2^31-1", window),
                ));
            }
        }
        if let Some(size) = self.get(SettingsId::MaxFrameSize) {
            if !(DEFAULT_MAX_FRAME_SIZE..=MAX_MAX_FRAME_SIZE).contains(&size) {
                return Err(Error::protocol(
                    ErrorCode::ProtocolError,
                    format!("SETTINGS_MAX_FRAME_SIZE {} out of range", size),
                ));
            }
        }
        Ok(())
    }
}
