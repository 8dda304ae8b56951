#![allow(dead_code)]

use num_derive::FromPrimitive;

use crate::error::{DumpError, DumpResult};

#[repr(u32)]
#[derive(Debug, Copy, Clone, FromPrimitive)]
pub enum CpuABI {
    ABI64 = 0x01000000,
    ABI64_32 = 0x02000000,
}

impl CpuABI {
    pub const MASK: u32 = 0xff000000;
}

#[repr(u32)]
#[derive(Debug, Copy, Clone, FromPrimitive, PartialEq, Eq, Hash)]
pub enum CpuType {
    Any = 0,
    Vax = 1,
    Mc680x0 = 6,
    I386 = 7,
    X86_64 = 7 | CpuABI::ABI64 as u32,
    Arm = 12,
    Arm64 = 12 | CpuABI::ABI64 as u32,
    Arm64_32 = 12 | CpuABI::ABI64_32 as u32,
    Sparc = 14,
    PowerPC = 18,
    PowerPC64 = 18 | CpuABI::ABI64 as u32,
}

impl CpuType {
    pub fn from_raw(raw: u32) -> DumpResult<CpuType> {
        num::FromPrimitive::from_u32(raw)
            .ok_or_else(|| DumpError::InvalidInput(format!("unknown cpu type {raw:#x}")))
    }

    pub fn is64(&self) -> bool {
        (*self as u32) & CpuABI::ABI64 as u32 != 0
    }

    pub fn name(&self) -> &'static str {
        match self {
            CpuType::I386 => "i386",
            CpuType::X86_64 => "x86_64",
            CpuType::Arm => "arm",
            CpuType::Arm64 => "arm64",
            CpuType::Arm64_32 => "arm64_32",
            CpuType::PowerPC => "ppc",
            CpuType::PowerPC64 => "ppc64",
            _ => "unknown",
        }
    }
}

/// Raw cpusubtype word.
///
/// The high byte carries capability bits that must survive parsing: for
/// arm64e they say whether the slice uses hardware TBI and which pointer
/// authentication ABI it was built for, which in turn selects the chained
/// pointer format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuSubType {
    pub raw: u32,
}

impl CpuSubType {
    pub const CAPS_MASK: u32 = 0xff000000;
    pub const PTRAUTH_ABI: u32 = 0x80000000;

    pub const ARM64_ALL: u32 = 0;
    pub const ARM64_V8: u32 = 1;
    pub const ARM64E: u32 = 2;

    pub fn new(raw: u32) -> Self {
        CpuSubType { raw }
    }

    /// Subtype value with the capability byte stripped.
    pub fn value(&self) -> u32 {
        self.raw & !Self::CAPS_MASK
    }

    pub fn caps(&self) -> u8 {
        ((self.raw & Self::CAPS_MASK) >> 24) as u8
    }

    pub fn is_arm64e(&self, cpu: CpuType) -> bool {
        cpu == CpuType::Arm64 && self.value() == Self::ARM64E
    }

    /// Versioned-ABI bit: kernel-style arm64e pointer authentication.
    pub fn ptrauth_abi(&self) -> bool {
        self.raw & Self::PTRAUTH_ABI != 0
    }

    pub fn matches(&self, wanted: u32) -> bool {
        wanted == 0 || self.value() == wanted & !Self::CAPS_MASK
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_type_roundtrip() {
        assert_eq!(CpuType::from_raw(0x0100000c).unwrap(), CpuType::Arm64);
        assert_eq!(CpuType::from_raw(0x01000007).unwrap(), CpuType::X86_64);
        assert!(CpuType::Arm64.is64());
        assert!(!CpuType::Arm.is64());
        assert!(CpuType::from_raw(0xdead).is_err());
    }

    #[test]
    fn subtype_preserves_arm64e_caps() {
        // arm64e with ptrauth ABI versioning, as found in /usr/lib dylibs.
        let sub = CpuSubType::new(0x80000002);
        assert_eq!(sub.value(), CpuSubType::ARM64E);
        assert!(sub.is_arm64e(CpuType::Arm64));
        assert!(sub.ptrauth_abi());
        assert_eq!(sub.caps(), 0x80);
    }

    #[test]
    fn subtype_match_rules() {
        let sub = CpuSubType::new(CpuSubType::ARM64E);
        assert!(sub.matches(0));
        assert!(sub.matches(CpuSubType::ARM64E));
        assert!(!sub.matches(CpuSubType::ARM64_V8));
    }
}
