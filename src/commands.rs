#![allow(dead_code)]

use nom::number::complete::{u32 as nom_u32, u64 as nom_u64};
use num_derive::FromPrimitive;
use strum_macros::{Display, EnumString};
use uuid::Uuid;

use crate::error::{DumpError, DumpResult};
use crate::helpers::{source_version_string, version_string};
use crate::reader::Endian;
use crate::segment::Segment;

pub const LC_REQ_DYLD: u32 = 0x80000000;

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
pub enum LCLoadCommand {
    LcSegment = 0x1,
    LcSymtab = 0x2,
    LcDysymtab = 0xb,
    LcLoadDylib = 0xc,
    LcIdDylib = 0xd,
    LcLoadWeakDylib = 0x18 | LC_REQ_DYLD,
    LcSegment64 = 0x19,
    LcUuid = 0x1b,
    LcRpath = 0x1c | LC_REQ_DYLD,
    LcCodeSignature = 0x1d,
    LcReexportDylib = 0x1f | LC_REQ_DYLD,
    LcLazyLoadDylib = 0x20,
    LcEncryptionInfo = 0x21,
    LcDyldInfo = 0x22,
    LcDyldInfoOnly = 0x22 | LC_REQ_DYLD,
    LcLoadUpwardDylib = 0x23 | LC_REQ_DYLD,
    LcVersionMinMacosx = 0x24,
    LcVersionMinIphoneos = 0x25,
    LcFunctionStarts = 0x26,
    LcMain = 0x28 | LC_REQ_DYLD,
    LcDataInCode = 0x29,
    LcSourceVersion = 0x2a,
    LcEncryptionInfo64 = 0x2c,
    LcVersionMinTvos = 0x2f,
    LcVersionMinWatchos = 0x30,
    LcBuildVersion = 0x32,
    LcDyldExportsTrie = 0x33 | LC_REQ_DYLD,
    LcDyldChainedFixups = 0x34 | LC_REQ_DYLD,
    LcFilesetEntry = 0x35 | LC_REQ_DYLD,
}

impl LCLoadCommand {
    pub fn from_raw(raw: u32) -> Option<LCLoadCommand> {
        num::FromPrimitive::from_u32(raw)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LoadCommandBase {
    pub cmd: u32,
    pub cmdsize: u32,
}

impl LoadCommandBase {
    pub const SIZE: usize = 8;

    pub fn parse(bytes: &[u8], endian: Endian) -> nom::IResult<&[u8], LoadCommandBase> {
        let (bytes, cmd) = nom_u32(endian.nom())(bytes)?;
        let (bytes, cmdsize) = nom_u32(endian.nom())(bytes)?;
        Ok((bytes, LoadCommandBase { cmd, cmdsize }))
    }
}

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, EnumString, Display)]
pub enum Platform {
    Unknown = 0,
    MacOS = 1,
    IOS = 2,
    TvOS = 3,
    WatchOS = 4,
    BridgeOS = 5,
    MacCatalyst = 6,
    IOSSimulator = 7,
    TvOSSimulator = 8,
    WatchOSSimulator = 9,
    DriverKit = 10,
    VisionOS = 11,
    VisionOSSimulator = 12,
    Firmware = 13,
    SepOS = 14,
}

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, EnumString, Display)]
pub enum Tool {
    Clang = 1,
    Swift = 2,
    Ld = 3,
    Lld = 4,
    Metal = 1024,
    Airlld = 1025,
    Airnt = 1026,
    AirntPlugin = 1027,
    Airpack = 1028,
    Gpuarchiver = 1031,
    MetalFramework = 1032,
}

/// `LC_LOAD_DYLIB` and friends; which flavor is kept on the enum variant's
/// `weak`/`kind` fields rather than separate types.
#[derive(Debug, Clone)]
pub struct DylibCommand {
    pub name: String,
    pub timestamp: u32,
    pub current_version: u32,
    pub compat_version: u32,
    pub weak: bool,
}

impl DylibCommand {
    pub fn current_version_string(&self) -> String {
        version_string(self.current_version)
    }

    pub fn compat_version_string(&self) -> String {
        version_string(self.compat_version)
    }

    fn parse(cmd: &[u8], base: LoadCommandBase, endian: Endian, weak: bool) -> DumpResult<Self> {
        let body = command_body(cmd, base)?;
        let (_, (name_offset, timestamp, current_version, compat_version)) =
            nom::sequence::tuple((
                nom_u32(endian.nom()),
                nom_u32(endian.nom()),
                nom_u32(endian.nom()),
                nom_u32(endian.nom()),
            ))(body)
            .map_err(|_: NomErr<'_>| truncated(base))?;
        let name = lc_str(cmd, base, name_offset)?;
        Ok(DylibCommand {
            name,
            timestamp,
            current_version,
            compat_version,
            weak,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct UuidCommand {
    pub uuid: Uuid,
}

impl UuidCommand {
    fn parse(cmd: &[u8], base: LoadCommandBase) -> DumpResult<Self> {
        let body = command_body(cmd, base)?;
        let raw: [u8; 16] = body
            .get(..16)
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| truncated(base))?;
        Ok(UuidCommand {
            uuid: Uuid::from_bytes(raw),
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BuildToolVersion {
    pub tool: Option<Tool>,
    pub raw_tool: u32,
    pub version: u32,
}

#[derive(Debug, Clone)]
pub struct BuildVersionCommand {
    pub platform: Platform,
    pub minos: u32,
    pub sdk: u32,
    pub tools: Vec<BuildToolVersion>,
}

impl BuildVersionCommand {
    pub fn minos_string(&self) -> String {
        version_string(self.minos)
    }

    pub fn sdk_string(&self) -> String {
        version_string(self.sdk)
    }

    fn parse(cmd: &[u8], base: LoadCommandBase, endian: Endian) -> DumpResult<Self> {
        let e = endian.nom();
        let body = command_body(cmd, base)?;
        let (mut cursor, (platform_raw, minos, sdk, ntools)) =
            nom::sequence::tuple((nom_u32(e), nom_u32(e), nom_u32(e), nom_u32(e)))(body)
                .map_err(|_: NomErr<'_>| truncated(base))?;
        let platform =
            num::FromPrimitive::from_u32(platform_raw).unwrap_or(Platform::Unknown);
        let mut tools = Vec::with_capacity(ntools as usize);
        for _ in 0..ntools {
            let (next, (raw_tool, version)) =
                nom::sequence::tuple((nom_u32(e), nom_u32(e)))(cursor)
                    .map_err(|_: NomErr<'_>| truncated(base))?;
            cursor = next;
            tools.push(BuildToolVersion {
                tool: num::FromPrimitive::from_u32(raw_tool),
                raw_tool,
                version,
            });
        }
        Ok(BuildVersionCommand {
            platform,
            minos,
            sdk,
            tools,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct VersionMinCommand {
    pub platform: Platform,
    pub version: u32,
    pub sdk: u32,
}

impl VersionMinCommand {
    fn parse(
        cmd: &[u8],
        base: LoadCommandBase,
        endian: Endian,
        platform: Platform,
    ) -> DumpResult<Self> {
        let body = command_body(cmd, base)?;
        let (_, (version, sdk)) =
            nom::sequence::tuple((nom_u32(endian.nom()), nom_u32(endian.nom())))(body)
                .map_err(|_: NomErr<'_>| truncated(base))?;
        Ok(VersionMinCommand {
            platform,
            version,
            sdk,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EntryPointCommand {
    pub entryoff: u64,
    pub stacksize: u64,
}

impl EntryPointCommand {
    fn parse(cmd: &[u8], base: LoadCommandBase, endian: Endian) -> DumpResult<Self> {
        let body = command_body(cmd, base)?;
        let (_, (entryoff, stacksize)) =
            nom::sequence::tuple((nom_u64(endian.nom()), nom_u64(endian.nom())))(body)
                .map_err(|_: NomErr<'_>| truncated(base))?;
        Ok(EntryPointCommand { entryoff, stacksize })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EncryptionInfoCommand {
    pub cryptoff: u32,
    pub cryptsize: u32,
    pub cryptid: u32,
    pub is64: bool,
}

impl EncryptionInfoCommand {
    fn parse(cmd: &[u8], base: LoadCommandBase, endian: Endian, is64: bool) -> DumpResult<Self> {
        let e = endian.nom();
        let body = command_body(cmd, base)?;
        let (_, (cryptoff, cryptsize, cryptid)) =
            nom::sequence::tuple((nom_u32(e), nom_u32(e), nom_u32(e)))(body)
                .map_err(|_: NomErr<'_>| truncated(base))?;
        Ok(EncryptionInfoCommand {
            cryptoff,
            cryptsize,
            cryptid,
            is64,
        })
    }
}

/// `LC_CODE_SIGNATURE`, `LC_DYLD_CHAINED_FIXUPS` and the other commands
/// that are just an offset/size pair into `__LINKEDIT`.
#[derive(Debug, Clone, Copy)]
pub struct LinkeditDataCommand {
    pub dataoff: u32,
    pub datasize: u32,
}

impl LinkeditDataCommand {
    fn parse(cmd: &[u8], base: LoadCommandBase, endian: Endian) -> DumpResult<Self> {
        let body = command_body(cmd, base)?;
        let (_, (dataoff, datasize)) =
            nom::sequence::tuple((nom_u32(endian.nom()), nom_u32(endian.nom())))(body)
                .map_err(|_: NomErr<'_>| truncated(base))?;
        Ok(LinkeditDataCommand { dataoff, datasize })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SourceVersionCommand {
    pub version: u64,
}

impl SourceVersionCommand {
    pub fn version_string(&self) -> String {
        source_version_string(self.version)
    }

    fn parse(cmd: &[u8], base: LoadCommandBase, endian: Endian) -> DumpResult<Self> {
        let body = command_body(cmd, base)?;
        let (_, version) =
            nom_u64(endian.nom())(body).map_err(|_: NomErr<'_>| truncated(base))?;
        Ok(SourceVersionCommand { version })
    }
}

#[derive(Debug, Clone)]
pub struct RpathCommand {
    pub path: String,
}

impl RpathCommand {
    fn parse(cmd: &[u8], base: LoadCommandBase, endian: Endian) -> DumpResult<Self> {
        let body = command_body(cmd, base)?;
        let (_, path_offset) =
            nom_u32(endian.nom())(body).map_err(|_: NomErr<'_>| truncated(base))?;
        Ok(RpathCommand {
            path: lc_str(cmd, base, path_offset)?,
        })
    }
}

/// Commands the extractor has no use for are kept with their declared
/// extent so nothing in the file is silently dropped.
#[derive(Debug, Clone, Copy)]
pub struct UnknownCommand {
    pub cmd: u32,
    pub cmdsize: u32,
}

#[derive(Debug, Clone)]
pub enum LoadCommand {
    Segment(Segment),
    LoadDylib(DylibCommand),
    IdDylib(DylibCommand),
    Uuid(UuidCommand),
    BuildVersion(BuildVersionCommand),
    VersionMin(VersionMinCommand),
    Main(EntryPointCommand),
    EncryptionInfo(EncryptionInfoCommand),
    CodeSignature(LinkeditDataCommand),
    ChainedFixups(LinkeditDataCommand),
    SourceVersion(SourceVersionCommand),
    Rpath(RpathCommand),
    Unknown(UnknownCommand),
}

type NomErr<'a> = nom::Err<nom::error::Error<&'a [u8]>>;

fn truncated(base: LoadCommandBase) -> DumpError {
    DumpError::Inconsistent(format!(
        "load command {:#x} truncated (cmdsize {:#x})",
        base.cmd, base.cmdsize
    ))
}

/// The command bytes after the 8-byte base header.
fn command_body(cmd: &[u8], base: LoadCommandBase) -> DumpResult<&[u8]> {
    cmd.get(LoadCommandBase::SIZE..)
        .ok_or_else(|| truncated(base))
}

/// An `lc_str`: offset relative to the start of the command, string bounded
/// by the command size.
fn lc_str(cmd: &[u8], base: LoadCommandBase, offset: u32) -> DumpResult<String> {
    let bytes = cmd
        .get(offset as usize..)
        .ok_or_else(|| truncated(base))?;
    let (_, s) = crate::helpers::string_upto_null_terminator(bytes)
        .map_err(|_| truncated(base))?;
    Ok(s)
}

impl LoadCommand {
    /// Parse one load command from `cmd` (the full command bytes, base
    /// included). Unrecognized `cmd` values never fail; they are recorded
    /// with their declared size and skipped.
    pub fn parse(
        cmd: &[u8],
        base: LoadCommandBase,
        is64: bool,
        endian: Endian,
    ) -> DumpResult<LoadCommand> {
        use LCLoadCommand::*;

        let kind = match LCLoadCommand::from_raw(base.cmd) {
            Some(kind) => kind,
            None => {
                return Ok(LoadCommand::Unknown(UnknownCommand {
                    cmd: base.cmd,
                    cmdsize: base.cmdsize,
                }))
            }
        };

        let parsed = match kind {
            LcSegment | LcSegment64 => {
                let seg_is64 = kind == LcSegment64;
                let body = command_body(cmd, base)?;
                let fixed = Segment::fixed_size(seg_is64) - LoadCommandBase::SIZE;
                if body.len() < fixed {
                    return Err(DumpError::InvalidInput(format!(
                        "segment command truncated at {:#x}",
                        base.cmdsize
                    )));
                }
                let nsects_off = fixed - 8;
                let raw = [
                    body[nsects_off],
                    body[nsects_off + 1],
                    body[nsects_off + 2],
                    body[nsects_off + 3],
                ];
                let nsects = match endian {
                    Endian::Little => u32::from_le_bytes(raw),
                    Endian::Big => u32::from_be_bytes(raw),
                };
                let expect = Segment::fixed_size(seg_is64)
                    + nsects as usize * Segment::section_size(seg_is64);
                if expect > base.cmdsize as usize {
                    return Err(DumpError::InvalidInput(format!(
                        "segment declares {nsects} sections but cmdsize is {:#x}",
                        base.cmdsize
                    )));
                }
                let (_, seg) = Segment::parse(body, seg_is64, endian).map_err(|_| {
                    DumpError::InvalidInput("corrupt segment command".into())
                })?;
                LoadCommand::Segment(seg)
            }
            LcLoadDylib | LcReexportDylib | LcLazyLoadDylib | LcLoadUpwardDylib => {
                LoadCommand::LoadDylib(DylibCommand::parse(cmd, base, endian, false)?)
            }
            LcLoadWeakDylib => {
                LoadCommand::LoadDylib(DylibCommand::parse(cmd, base, endian, true)?)
            }
            LcIdDylib => LoadCommand::IdDylib(DylibCommand::parse(cmd, base, endian, false)?),
            LcUuid => LoadCommand::Uuid(UuidCommand::parse(cmd, base)?),
            LcBuildVersion => {
                LoadCommand::BuildVersion(BuildVersionCommand::parse(cmd, base, endian)?)
            }
            LcVersionMinMacosx => LoadCommand::VersionMin(VersionMinCommand::parse(
                cmd,
                base,
                endian,
                Platform::MacOS,
            )?),
            LcVersionMinIphoneos => LoadCommand::VersionMin(VersionMinCommand::parse(
                cmd,
                base,
                endian,
                Platform::IOS,
            )?),
            LcVersionMinTvos => LoadCommand::VersionMin(VersionMinCommand::parse(
                cmd,
                base,
                endian,
                Platform::TvOS,
            )?),
            LcVersionMinWatchos => LoadCommand::VersionMin(VersionMinCommand::parse(
                cmd,
                base,
                endian,
                Platform::WatchOS,
            )?),
            LcMain => LoadCommand::Main(EntryPointCommand::parse(cmd, base, endian)?),
            LcEncryptionInfo => LoadCommand::EncryptionInfo(EncryptionInfoCommand::parse(
                cmd, base, endian, false,
            )?),
            LcEncryptionInfo64 => LoadCommand::EncryptionInfo(EncryptionInfoCommand::parse(
                cmd, base, endian, true,
            )?),
            LcCodeSignature => {
                LoadCommand::CodeSignature(LinkeditDataCommand::parse(cmd, base, endian)?)
            }
            LcDyldChainedFixups => {
                LoadCommand::ChainedFixups(LinkeditDataCommand::parse(cmd, base, endian)?)
            }
            LcSourceVersion => {
                LoadCommand::SourceVersion(SourceVersionCommand::parse(cmd, base, endian)?)
            }
            LcRpath => LoadCommand::Rpath(RpathCommand::parse(cmd, base, endian)?),
            _ => LoadCommand::Unknown(UnknownCommand {
                cmd: base.cmd,
                cmdsize: base.cmdsize,
            }),
        };

        Ok(parsed)
    }
}

#[cfg(test)]
pub mod testutil {
    use super::*;

    pub fn encode_base(cmd: u32, cmdsize: u32) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&cmd.to_le_bytes());
        buf.extend_from_slice(&cmdsize.to_le_bytes());
        buf
    }

    pub fn encode_dylib(cmd: u32, name: &str) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&24u32.to_le_bytes()); // lc_str offset
        body.extend_from_slice(&2u32.to_le_bytes()); // timestamp
        body.extend_from_slice(&0x00010000u32.to_le_bytes());
        body.extend_from_slice(&0x00010000u32.to_le_bytes());
        body.extend_from_slice(name.as_bytes());
        body.push(0);
        while (body.len() + 8) % 8 != 0 {
            body.push(0);
        }
        let mut buf = encode_base(cmd, (body.len() + 8) as u32);
        buf.extend_from_slice(&body);
        buf
    }

    pub fn encode_uuid(bytes: [u8; 16]) -> Vec<u8> {
        let mut buf = encode_base(LCLoadCommand::LcUuid as u32, 24);
        buf.extend_from_slice(&bytes);
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::*;
    use super::*;

    fn parse_one(buf: &[u8]) -> LoadCommand {
        let (_, base) = LoadCommandBase::parse(buf, Endian::Little).unwrap();
        LoadCommand::parse(buf, base, true, Endian::Little).unwrap()
    }

    #[test]
    fn dylib_name_from_lc_str() {
        let buf = encode_dylib(
            LCLoadCommand::LcLoadDylib as u32,
            "/usr/lib/libobjc.A.dylib",
        );
        match parse_one(&buf) {
            LoadCommand::LoadDylib(dylib) => {
                assert_eq!(dylib.name, "/usr/lib/libobjc.A.dylib");
                assert!(!dylib.weak);
                assert_eq!(dylib.current_version_string(), "1.0.0");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn weak_dylib_sets_flag() {
        let buf = encode_dylib(LCLoadCommand::LcLoadWeakDylib as u32, "/usr/lib/libz.dylib");
        match parse_one(&buf) {
            LoadCommand::LoadDylib(dylib) => assert!(dylib.weak),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn unknown_command_is_recorded_not_fatal() {
        let buf = encode_base(0x7777, 16);
        let (_, base) = LoadCommandBase::parse(&buf, Endian::Little).unwrap();
        match LoadCommand::parse(&buf, base, true, Endian::Little).unwrap() {
            LoadCommand::Unknown(unknown) => {
                assert_eq!(unknown.cmd, 0x7777);
                assert_eq!(unknown.cmdsize, 16);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn build_version_tools() {
        let mut buf = encode_base(LCLoadCommand::LcBuildVersion as u32, 32);
        buf.extend_from_slice(&(Platform::IOS as u32).to_le_bytes());
        buf.extend_from_slice(&0x000E0000u32.to_le_bytes()); // minos 14.0
        buf.extend_from_slice(&0x00110200u32.to_le_bytes()); // sdk 17.2
        buf.extend_from_slice(&1u32.to_le_bytes());
        buf.extend_from_slice(&(Tool::Ld as u32).to_le_bytes());
        buf.extend_from_slice(&0x03540000u32.to_le_bytes());
        match parse_one(&buf) {
            LoadCommand::BuildVersion(bv) => {
                assert_eq!(bv.platform, Platform::IOS);
                assert_eq!(bv.minos_string(), "14.0.0");
                assert_eq!(bv.sdk_string(), "17.2.0");
                assert_eq!(bv.tools.len(), 1);
                assert_eq!(bv.tools[0].tool, Some(Tool::Ld));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn segment_with_bad_section_count_is_fatal() {
        use crate::segment::testutil::{encode_segment64, plain_segment};
        let seg = plain_segment("__TEXT", 0, 0x1000, 0);
        let body = encode_segment64(&seg);
        let mut buf = encode_base(LCLoadCommand::LcSegment64 as u32, (body.len() + 8) as u32);
        buf.extend_from_slice(&body);
        // Claim 4 sections that are not actually present.
        buf[8 + 56..8 + 60].copy_from_slice(&4u32.to_le_bytes());
        let (_, base) = LoadCommandBase::parse(&buf, Endian::Little).unwrap();
        assert!(LoadCommand::parse(&buf, base, true, Endian::Little).is_err());
    }
}
