//! Memory region descriptors.
use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::handle::{AsHandle, Handle};
use crate::ibv::{ProtectionDomain, Sge};

bitflags! {
    /// Access flags of a memory region.
    #[derive(Serialize, Deserialize)]
    #[derive(Default)]
    pub struct AccessFlags: u32 {
        const LOCAL_WRITE = 0b00000001;
        const REMOTE_WRITE = 0b00000010;
        const REMOTE_READ = 0b00000100;
        const REMOTE_ATOMIC = 0b00001000;
    }
}

/// What a peer needs to address this region with a one-sided operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemoteKey {
    pub rkey: u32,
    pub addr: u64,
}

/// A registered buffer. It does not own the memory it describes; the registrant must keep the
/// buffer alive until the region is deregistered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemoryRegion {
    pub handle: Handle,
    pub pd: ProtectionDomain,
    pub addr: u64,
    pub length: usize,
    pub lkey: u32,
    pub rkey: u32,
    pub access: AccessFlags,
}

impl AsHandle for MemoryRegion {
    #[inline]
    fn as_handle(&self) -> Handle {
        self.handle
    }
}

impl MemoryRegion {
    #[inline]
    pub fn rkey(&self) -> RemoteKey {
        RemoteKey {
            rkey: self.rkey,
            addr: self.addr,
        }
    }

    /// A scatter/gather element covering the whole region.
    #[inline]
    pub fn sge(&self) -> Sge {
        Sge::from_mr(self, 0, self.length)
    }

    #[inline]
    pub fn contains(&self, addr: u64, length: usize) -> bool {
        let Some(region_end) = self.addr.checked_add(self.length as u64) else {
            return false;
        };
        self.addr <= addr
            && addr
                .checked_add(length as u64)
                .map_or(false, |end| end <= region_end)
    }
}
