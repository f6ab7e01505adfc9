//! The kernel surface this library consumes: one trait describing the
//! entry points the loader needs, and the production implementation that
//! issues the VM syscall through libc.
//!
//! Keeping the surface behind a trait lets the whole load pipeline run
//! against a scripted kernel in tests.

use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::RawFd;
use std::path::Path;

use crate::insn::Insn;
use crate::kind::{AttachKind, ProgramKind};

/// Size of the kernel's object-name field (15 characters plus NUL).
pub const OBJ_NAME_LEN: usize = 16;
/// Size of the verifier log buffer captured on failed submissions.
pub const LOG_BUF_SIZE: usize = 256 * 1024;

const CMD_MAP_CREATE: libc::c_int = 0;
const CMD_PROG_LOAD: libc::c_int = 5;
const CMD_OBJ_PIN: libc::c_int = 6;
const CMD_OBJ_GET_INFO_BY_FD: libc::c_int = 15;
const CMD_TYPE_INFO_LOAD: libc::c_int = 18;

/// Parameters for creating one map.
#[derive(Debug, Clone)]
pub struct MapCreateAttr<'a> {
    pub name: &'a str,
    pub kind: u32,
    pub key_size: u32,
    pub value_size: u32,
    pub max_entries: u32,
    pub flags: u32,
    pub ifindex: u32,
    pub type_info_fd: u32,
    pub key_type_id: u32,
    pub value_type_id: u32,
}

/// Parameters for submitting one program to the verifier.
#[derive(Debug, Clone)]
pub struct ProgramLoadAttr<'a> {
    pub kind: ProgramKind,
    pub expected_attach: Option<AttachKind>,
    pub name: &'a str,
    pub insns: &'a [Insn],
    pub license: &'a str,
    pub kernel_version: u32,
    pub ifindex: u32,
}

/// Map parameters as reported back by the kernel for an open descriptor.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MapInfo {
    pub kind: u32,
    pub id: u32,
    pub key_size: u32,
    pub value_size: u32,
    pub max_entries: u32,
    pub flags: u32,
    pub name: String,
    pub ifindex: u32,
    pub key_type_id: u32,
    pub value_type_id: u32,
}

/// The kernel entry points the loader drives. Descriptors handed out by
/// these calls are owned by the caller and returned through `close`.
pub trait Kernel {
    fn create_map(&self, attr: &MapCreateAttr<'_>) -> io::Result<RawFd>;

    /// Submit a program. On failure, if `log` is given, the submission is
    /// repeated with a verifier log buffer and whatever the verifier said
    /// is appended to `log`; the original error is returned either way.
    fn load_program(&self, attr: &ProgramLoadAttr<'_>, log: Option<&mut String>)
        -> io::Result<RawFd>;

    /// Hand a raw type-metadata blob to the kernel, yielding a descriptor
    /// for map creation to reference.
    fn load_type_info(&self, raw: &[u8]) -> io::Result<RawFd>;

    fn map_info(&self, fd: RawFd) -> io::Result<MapInfo>;

    fn pin(&self, fd: RawFd, path: &Path) -> io::Result<()>;

    fn dup_cloexec(&self, fd: RawFd) -> io::Result<RawFd>;

    fn close(&self, fd: RawFd);
}

/// The real kernel.
#[derive(Debug, Default, Clone, Copy)]
pub struct Sys;

#[repr(C)]
struct RawMapCreate {
    map_type: u32,
    key_size: u32,
    value_size: u32,
    max_entries: u32,
    map_flags: u32,
    inner_map_fd: u32,
    numa_node: u32,
    map_name: [u8; OBJ_NAME_LEN],
    map_ifindex: u32,
    type_info_fd: u32,
    key_type_id: u32,
    value_type_id: u32,
}

#[repr(C)]
struct RawProgLoad {
    prog_type: u32,
    insn_cnt: u32,
    insns: u64,
    license: u64,
    log_level: u32,
    log_size: u32,
    log_buf: u64,
    kern_version: u32,
    prog_flags: u32,
    prog_name: [u8; OBJ_NAME_LEN],
    prog_ifindex: u32,
    expected_attach_type: u32,
}

#[repr(C)]
struct RawObjPin {
    pathname: u64,
    bpf_fd: u32,
    file_flags: u32,
}

#[repr(C)]
struct RawObjGetInfo {
    bpf_fd: u32,
    info_len: u32,
    info: u64,
}

#[repr(C)]
struct RawMapInfo {
    map_type: u32,
    id: u32,
    key_size: u32,
    value_size: u32,
    max_entries: u32,
    map_flags: u32,
    name: [u8; OBJ_NAME_LEN],
    ifindex: u32,
    netns_dev: u64,
    netns_ino: u64,
    type_info_id: u32,
    key_type_id: u32,
    value_type_id: u32,
}

#[repr(C)]
struct RawTypeInfoLoad {
    type_info: u64,
    log_buf: u64,
    type_info_size: u32,
    log_size: u32,
    log_level: u32,
}

unsafe fn vm_syscall<T>(cmd: libc::c_int, attr: &mut T) -> libc::c_long {
    libc::syscall(
        libc::SYS_bpf,
        cmd,
        attr as *mut T as *mut libc::c_void,
        std::mem::size_of::<T>() as libc::c_uint,
    )
}

/// Truncate a name into the kernel's fixed object-name field.
pub(crate) fn obj_name(name: &str) -> [u8; OBJ_NAME_LEN] {
    let mut out = [0u8; OBJ_NAME_LEN];
    for (dst, src) in out[..OBJ_NAME_LEN - 1].iter_mut().zip(name.bytes()) {
        *dst = src;
    }
    out
}

fn name_str(raw: &[u8; OBJ_NAME_LEN]) -> String {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

impl Sys {
    fn submit(&self, attr: &ProgramLoadAttr<'_>, log: Option<&mut String>) -> io::Result<RawFd> {
        let license = CString::new(attr.license)
            .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;

        let mut raw = RawProgLoad {
            prog_type: attr.kind.to_u32(),
            insn_cnt: attr.insns.len() as u32,
            insns: attr.insns.as_ptr() as u64,
            license: license.as_ptr() as u64,
            log_level: 0,
            log_size: 0,
            log_buf: 0,
            kern_version: attr.kernel_version,
            prog_flags: 0,
            prog_name: obj_name(attr.name),
            prog_ifindex: attr.ifindex,
            expected_attach_type: attr.expected_attach.map_or(0, AttachKind::to_u32),
        };

        let ret = unsafe { vm_syscall(CMD_PROG_LOAD, &mut raw) };
        if ret >= 0 {
            return Ok(ret as RawFd);
        }
        let err = io::Error::last_os_error();

        if let Some(log) = log {
            let mut buf = vec![0u8; LOG_BUF_SIZE];
            raw.log_buf = buf.as_mut_ptr() as u64;
            raw.log_size = LOG_BUF_SIZE as u32;
            raw.log_level = 1;
            let ret = unsafe { vm_syscall(CMD_PROG_LOAD, &mut raw) };
            if ret >= 0 {
                return Ok(ret as RawFd);
            }
            let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
            log.push_str(&String::from_utf8_lossy(&buf[..end]));
        }

        Err(err)
    }
}

impl Kernel for Sys {
    fn create_map(&self, attr: &MapCreateAttr<'_>) -> io::Result<RawFd> {
        let mut raw = RawMapCreate {
            map_type: attr.kind,
            key_size: attr.key_size,
            value_size: attr.value_size,
            max_entries: attr.max_entries,
            map_flags: attr.flags,
            inner_map_fd: 0,
            numa_node: 0,
            map_name: obj_name(attr.name),
            map_ifindex: attr.ifindex,
            type_info_fd: attr.type_info_fd,
            key_type_id: attr.key_type_id,
            value_type_id: attr.value_type_id,
        };

        let ret = unsafe { vm_syscall(CMD_MAP_CREATE, &mut raw) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(ret as RawFd)
    }

    fn load_program(
        &self,
        attr: &ProgramLoadAttr<'_>,
        log: Option<&mut String>,
    ) -> io::Result<RawFd> {
        self.submit(attr, log)
    }

    fn load_type_info(&self, raw_info: &[u8]) -> io::Result<RawFd> {
        let mut raw = RawTypeInfoLoad {
            type_info: raw_info.as_ptr() as u64,
            log_buf: 0,
            type_info_size: raw_info.len() as u32,
            log_size: 0,
            log_level: 0,
        };

        let ret = unsafe { vm_syscall(CMD_TYPE_INFO_LOAD, &mut raw) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(ret as RawFd)
    }

    fn map_info(&self, fd: RawFd) -> io::Result<MapInfo> {
        let mut info: RawMapInfo = unsafe { std::mem::zeroed() };
        let mut raw = RawObjGetInfo {
            bpf_fd: fd as u32,
            info_len: std::mem::size_of::<RawMapInfo>() as u32,
            info: &mut info as *mut RawMapInfo as u64,
        };

        let ret = unsafe { vm_syscall(CMD_OBJ_GET_INFO_BY_FD, &mut raw) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(MapInfo {
            kind: info.map_type,
            id: info.id,
            key_size: info.key_size,
            value_size: info.value_size,
            max_entries: info.max_entries,
            flags: info.map_flags,
            name: name_str(&info.name),
            ifindex: info.ifindex,
            key_type_id: info.key_type_id,
            value_type_id: info.value_type_id,
        })
    }

    fn pin(&self, fd: RawFd, path: &Path) -> io::Result<()> {
        let pathname = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
        let mut raw = RawObjPin {
            pathname: pathname.as_ptr() as u64,
            bpf_fd: fd as u32,
            file_flags: 0,
        };

        let ret = unsafe { vm_syscall(CMD_OBJ_PIN, &mut raw) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn dup_cloexec(&self, fd: RawFd) -> io::Result<RawFd> {
        let ret = unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, 3) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(ret)
    }

    fn close(&self, fd: RawFd) {
        unsafe { libc::close(fd) };
    }
}
