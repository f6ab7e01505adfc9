//! Test support: a builder assembling minimal relocatable objects in
//! memory, a type-metadata blob builder, and a scripted kernel so the
//! whole load pipeline can run without privileges.

use std::collections::{BTreeSet, HashMap};
use std::io;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::insn::Insn;
use crate::io::{Writer, WriteData};
use crate::kind::ProgramKind;
use crate::sys::{Kernel, MapCreateAttr, MapInfo, ProgramLoadAttr};

/// Route crate logs to the test harness; honors RUST_LOG.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

const SHT_PROGBITS: u32 = 1;
const SHT_SYMTAB: u32 = 2;
const SHT_STRTAB: u32 = 3;
const SHT_REL: u32 = 9;
const SHF_ALLOC: u64 = 2;
const SHF_EXECINSTR: u64 = 4;

struct Section {
    name: String,
    sh_type: u32,
    flags: u64,
    data: Vec<u8>,
}

struct SymSpec {
    name: String,
    shndx: usize,
    value: u64,
    global: bool,
}

struct RelSpec {
    target: usize,
    /// (byte offset into the target section, symbol table index)
    entries: Vec<(u64, usize)>,
}

/// Assembles a little-endian relocatable object the way the compiler
/// would lay one out: user sections first, then relocation tables, the
/// symbol table and both string tables.
pub struct ObjBuilder {
    machine: u16,
    sections: Vec<Section>,
    syms: Vec<SymSpec>,
    rels: Vec<RelSpec>,
    extra_symtab: bool,
}

impl ObjBuilder {
    pub fn new() -> Self {
        Self {
            machine: 247,
            sections: Vec::new(),
            syms: Vec::new(),
            rels: Vec::new(),
            extra_symtab: false,
        }
    }

    pub fn machine(&mut self, machine: u16) -> &mut Self {
        self.machine = machine;
        self
    }

    pub fn duplicate_symtab(&mut self) -> &mut Self {
        self.extra_symtab = true;
        self
    }

    /// Plain data section; returns its section index.
    pub fn section(&mut self, name: &str, data: &[u8]) -> usize {
        self.push_section(name, SHT_PROGBITS, SHF_ALLOC, data)
    }

    /// Executable section holding instructions; returns its section index.
    pub fn exec_section(&mut self, name: &str, insns: &[Insn]) -> usize {
        self.push_section(name, SHT_PROGBITS, SHF_ALLOC | SHF_EXECINSTR, &insn_bytes(insns))
    }

    fn push_section(&mut self, name: &str, sh_type: u32, flags: u64, data: &[u8]) -> usize {
        self.sections.push(Section {
            name: name.to_string(),
            sh_type,
            flags,
            data: data.to_vec(),
        });
        self.sections.len()
    }

    /// Define a symbol; returns its symbol table index.
    pub fn global_sym(&mut self, name: &str, shndx: usize, value: u64) -> usize {
        self.sym(name, shndx, value, true)
    }

    pub fn local_sym(&mut self, name: &str, shndx: usize, value: u64) -> usize {
        self.sym(name, shndx, value, false)
    }

    fn sym(&mut self, name: &str, shndx: usize, value: u64, global: bool) -> usize {
        self.syms.push(SymSpec {
            name: name.to_string(),
            shndx,
            value,
            global,
        });
        self.syms.len()
    }

    /// Relocation table for `target`; entries are (byte offset, symbol).
    pub fn rel(&mut self, target: usize, entries: &[(u64, usize)]) -> &mut Self {
        self.rels.push(RelSpec {
            target,
            entries: entries.to_vec(),
        });
        self
    }

    pub fn build(&self) -> Vec<u8> {
        // Final layout: NULL, user sections, rel tables, symtab(s),
        // .strtab, .shstrtab.
        let symtab_count = if self.extra_symtab { 2 } else { 1 };
        let symtab_idx = 1 + self.sections.len() + self.rels.len();
        let strtab_idx = symtab_idx + symtab_count;
        let shstrtab_idx = strtab_idx + 1;
        let section_count = shstrtab_idx + 1;

        let mut strtab = vec![0u8];
        let mut sym_data = vec![0u8; 24];
        for spec in &self.syms {
            let name_off = strtab.len() as u32;
            strtab.extend_from_slice(spec.name.as_bytes());
            strtab.push(0);

            sym_data.write(name_off).unwrap();
            sym_data.write(if spec.global { 1u8 << 4 } else { 0u8 }).unwrap();
            sym_data.write(0u8).unwrap();
            sym_data.write(spec.shndx as u16).unwrap();
            sym_data.write(spec.value).unwrap();
            sym_data.write(0u64).unwrap();
        }

        struct Final {
            name: String,
            sh_type: u32,
            flags: u64,
            data: Vec<u8>,
            link: u32,
            info: u32,
            entsize: u64,
        }
        let mut finals = vec![Final {
            name: String::new(),
            sh_type: 0,
            flags: 0,
            data: Vec::new(),
            link: 0,
            info: 0,
            entsize: 0,
        }];
        for section in &self.sections {
            finals.push(Final {
                name: section.name.clone(),
                sh_type: section.sh_type,
                flags: section.flags,
                data: section.data.clone(),
                link: 0,
                info: 0,
                entsize: 0,
            });
        }
        for rel in &self.rels {
            let mut data = Vec::new();
            for &(offset, symnum) in &rel.entries {
                data.write(offset).unwrap();
                data.write((symnum as u64) << 32 | 1).unwrap();
            }
            finals.push(Final {
                name: format!(".rel{}", self.sections[rel.target - 1].name),
                sh_type: SHT_REL,
                flags: 0,
                data,
                link: symtab_idx as u32,
                info: rel.target as u32,
                entsize: 16,
            });
        }
        for _ in 0..symtab_count {
            finals.push(Final {
                name: ".symtab".to_string(),
                sh_type: SHT_SYMTAB,
                flags: 0,
                data: sym_data.clone(),
                link: strtab_idx as u32,
                info: 1,
                entsize: 24,
            });
        }
        finals.push(Final {
            name: ".strtab".to_string(),
            sh_type: SHT_STRTAB,
            flags: 0,
            data: strtab,
            link: 0,
            info: 0,
            entsize: 0,
        });

        let mut shstrtab = vec![0u8];
        let mut name_offsets = vec![0u32];
        for section in finals.iter().skip(1) {
            name_offsets.push(shstrtab.len() as u32);
            shstrtab.extend_from_slice(section.name.as_bytes());
            shstrtab.push(0);
        }
        name_offsets.push(shstrtab.len() as u32);
        shstrtab.extend_from_slice(b".shstrtab\0");
        finals.push(Final {
            name: ".shstrtab".to_string(),
            sh_type: SHT_STRTAB,
            flags: 0,
            data: shstrtab,
            link: 0,
            info: 0,
            entsize: 0,
        });
        assert_eq!(finals.len(), section_count);

        let data_total: usize = finals.iter().map(|f| f.data.len()).sum();
        let e_shoff = (64 + data_total + 7) & !7;

        let mut out = Vec::with_capacity(e_shoff + section_count * 64);
        out.extend_from_slice(&[0x7f, b'E', b'L', b'F', 2, 1, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
        out.write(1u16).unwrap(); // relocatable
        out.write(self.machine).unwrap();
        out.write(1u32).unwrap();
        out.write(0u64).unwrap(); // entry
        out.write(0u64).unwrap(); // phoff
        out.write(e_shoff as u64).unwrap();
        out.write(0u32).unwrap(); // flags
        out.write(64u16).unwrap();
        out.write(0u16).unwrap();
        out.write(0u16).unwrap();
        out.write(64u16).unwrap();
        out.write(section_count as u16).unwrap();
        out.write(shstrtab_idx as u16).unwrap();

        let mut offsets = Vec::with_capacity(section_count);
        for f in &finals {
            offsets.push(out.len());
            out.extend_from_slice(&f.data);
        }
        out.resize(e_shoff, 0);

        for (i, f) in finals.iter().enumerate() {
            out.write(name_offsets[i]).unwrap();
            out.write(f.sh_type).unwrap();
            out.write(f.flags).unwrap();
            out.write(0u64).unwrap(); // addr
            out.write(if i == 0 { 0u64 } else { offsets[i] as u64 }).unwrap();
            out.write(if i == 0 { 0u64 } else { f.data.len() as u64 }).unwrap();
            out.write(f.link).unwrap();
            out.write(f.info).unwrap();
            out.write(1u64).unwrap(); // addralign
            out.write(f.entsize).unwrap();
        }
        out
    }
}

/// A well-formed big-endian object header with no sections, for the
/// endianness check: it parses, but cannot come from this host's
/// toolchain.
pub fn big_endian_object() -> Vec<u8> {
    let mut out = vec![0x7f, b'E', b'L', b'F', 2, 2, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0];
    out.extend_from_slice(&1u16.to_be_bytes()); // relocatable
    out.extend_from_slice(&247u16.to_be_bytes());
    out.extend_from_slice(&1u32.to_be_bytes());
    out.extend_from_slice(&[0u8; 24]); // entry, phoff, shoff
    out.extend_from_slice(&0u32.to_be_bytes());
    out.extend_from_slice(&64u16.to_be_bytes());
    out.extend_from_slice(&[0u8; 6]); // phentsize, phnum, shentsize
    out.extend_from_slice(&[0u8; 4]); // shnum, shstrndx
    out
}

pub fn insn_bytes(insns: &[Insn]) -> Vec<u8> {
    let mut out = Vec::with_capacity(insns.len() * Insn::SIZE);
    for insn in insns {
        out.write(insn).unwrap();
    }
    out
}

/// A metadata blob describing one annotated map: two integer types and
/// the `____btf_map_<name>` container pointing at them.
pub fn type_info_blob(map_name: &str, key_size: u32, value_size: u32) -> Vec<u8> {
    let mut strings = vec![0u8];
    let intern = |s: &str, strings: &mut Vec<u8>| -> u32 {
        let off = strings.len() as u32;
        strings.extend_from_slice(s.as_bytes());
        strings.push(0);
        off
    };
    let key_name = intern("k", &mut strings);
    let value_name = intern("v", &mut strings);
    let container_name = intern(&format!("____btf_map_{map_name}"), &mut strings);
    let member_key = intern("key", &mut strings);
    let member_value = intern("value", &mut strings);

    let mut types = Vec::new();
    // id 1: integer key type
    types.write(key_name).unwrap();
    types.write(1u32 << 24).unwrap();
    types.write(key_size).unwrap();
    types.write(0u32).unwrap(); // encoding
    // id 2: integer value type
    types.write(value_name).unwrap();
    types.write(1u32 << 24).unwrap();
    types.write(value_size).unwrap();
    types.write(0u32).unwrap();
    // id 3: the container struct, two members
    types.write(container_name).unwrap();
    types.write(4u32 << 24 | 2).unwrap();
    types.write(key_size + value_size).unwrap();
    types.write(member_key).unwrap();
    types.write(1u32).unwrap();
    types.write(0u32).unwrap();
    types.write(member_value).unwrap();
    types.write(2u32).unwrap();
    types.write(key_size * 8).unwrap();

    let mut out = Vec::new();
    out.write(0xeb9fu16).unwrap();
    out.write(1u8).unwrap();
    out.write(0u8).unwrap();
    out.write(24u32).unwrap();
    out.write(0u32).unwrap(); // type_off
    out.write(types.len() as u32).unwrap();
    out.write(types.len() as u32).unwrap(); // str_off
    out.write(strings.len() as u32).unwrap();
    out.extend_from_slice(&types);
    out.extend_from_slice(&strings);
    out
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum MapCreateMode {
    #[default]
    Accept,
    /// Reject requests carrying type metadata; plain requests succeed.
    RejectTypeInfo,
    RejectAll,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub enum ProgLoadMode {
    #[default]
    Accept,
    /// Reject and write this verifier log when a buffer is supplied.
    RejectWithLog(String),
    Reject,
    /// Accept only submissions of this kind; everything else fails
    /// without a log.
    AcceptOnlyKind(ProgramKind),
    /// Reject submissions of the program with this name.
    RejectNamed(String),
}

#[derive(Debug, Clone)]
pub struct CreatedMap {
    pub fd: RawFd,
    pub name: String,
    pub kind: u32,
    pub key_size: u32,
    pub value_size: u32,
    pub max_entries: u32,
    pub flags: u32,
    pub type_info_fd: u32,
    pub key_type_id: u32,
    pub value_type_id: u32,
}

#[derive(Debug, Clone)]
pub struct LoadedProgram {
    pub fd: RawFd,
    pub name: String,
    pub kind: ProgramKind,
    pub attach: u32,
    pub insns: Vec<Insn>,
    pub license: String,
    pub kernel_version: u32,
}

#[derive(Debug, Default)]
pub struct FakeState {
    next_fd: RawFd,
    pub open_fds: BTreeSet<RawFd>,
    pub closed_unknown: Vec<RawFd>,
    pub maps: Vec<CreatedMap>,
    /// Every create request seen, successful or not: (name, key type id).
    pub map_create_calls: Vec<(String, u32)>,
    pub programs: Vec<LoadedProgram>,
    pub pins: Vec<(RawFd, PathBuf)>,
    pub map_mode: MapCreateMode,
    pub prog_mode: ProgLoadMode,
    pub infos: HashMap<RawFd, MapInfo>,
    /// Name of a map whose creation fails, scripted teardown tests.
    pub reject_map_named: Option<String>,
}

/// A kernel with scriptable behavior. Descriptors start at 100 so tests
/// can tell them apart from indices.
#[derive(Debug, Default)]
pub struct FakeKernel {
    pub state: Mutex<FakeState>,
}

impl FakeKernel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(configure: impl FnOnce(&mut FakeState)) -> Self {
        let fake = Self::default();
        configure(&mut fake.state.lock().unwrap());
        fake
    }

    /// Register a descriptor that exists outside this library, as if
    /// another process had created the map.
    pub fn add_external_map(&self, fd: RawFd, info: MapInfo) {
        let mut state = self.state.lock().unwrap();
        state.open_fds.insert(fd);
        state.infos.insert(fd, info);
    }

    pub fn open_fds(&self) -> BTreeSet<RawFd> {
        self.state.lock().unwrap().open_fds.clone()
    }
}

fn alloc_fd(state: &mut FakeState) -> RawFd {
    if state.next_fd < 100 {
        state.next_fd = 100;
    }
    let fd = state.next_fd;
    state.next_fd += 1;
    state.open_fds.insert(fd);
    fd
}

impl Kernel for FakeKernel {
    fn create_map(&self, attr: &MapCreateAttr<'_>) -> io::Result<RawFd> {
        let mut state = self.state.lock().unwrap();
        state
            .map_create_calls
            .push((attr.name.to_string(), attr.key_type_id));

        let mut reject = match state.map_mode {
            MapCreateMode::Accept => false,
            MapCreateMode::RejectTypeInfo => attr.key_type_id != 0,
            MapCreateMode::RejectAll => true,
        };
        if state.reject_map_named.as_deref() == Some(attr.name) {
            reject = true;
        }
        if reject {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }

        let fd = alloc_fd(&mut state);
        state.maps.push(CreatedMap {
            fd,
            name: attr.name.to_string(),
            kind: attr.kind,
            key_size: attr.key_size,
            value_size: attr.value_size,
            max_entries: attr.max_entries,
            flags: attr.flags,
            type_info_fd: attr.type_info_fd,
            key_type_id: attr.key_type_id,
            value_type_id: attr.value_type_id,
        });
        state.infos.insert(
            fd,
            MapInfo {
                kind: attr.kind,
                id: fd as u32,
                key_size: attr.key_size,
                value_size: attr.value_size,
                max_entries: attr.max_entries,
                flags: attr.flags,
                name: attr.name.to_string(),
                ifindex: attr.ifindex,
                key_type_id: attr.key_type_id,
                value_type_id: attr.value_type_id,
            },
        );
        Ok(fd)
    }

    fn load_program(
        &self,
        attr: &ProgramLoadAttr<'_>,
        log: Option<&mut String>,
    ) -> io::Result<RawFd> {
        let mut state = self.state.lock().unwrap();

        match &state.prog_mode {
            ProgLoadMode::Accept => {}
            ProgLoadMode::RejectWithLog(text) => {
                if let Some(log) = log {
                    log.push_str(text);
                }
                return Err(io::Error::from_raw_os_error(libc::EACCES));
            }
            ProgLoadMode::Reject => {
                return Err(io::Error::from_raw_os_error(libc::EINVAL));
            }
            ProgLoadMode::AcceptOnlyKind(kind) => {
                if attr.kind != *kind {
                    return Err(io::Error::from_raw_os_error(libc::EINVAL));
                }
            }
            ProgLoadMode::RejectNamed(name) => {
                if attr.name == name {
                    return Err(io::Error::from_raw_os_error(libc::EINVAL));
                }
            }
        }

        let fd = alloc_fd(&mut state);
        state.programs.push(LoadedProgram {
            fd,
            name: attr.name.to_string(),
            kind: attr.kind,
            attach: attr.expected_attach.map_or(0, |a| a.to_u32()),
            insns: attr.insns.to_vec(),
            license: attr.license.to_string(),
            kernel_version: attr.kernel_version,
        });
        Ok(fd)
    }

    fn load_type_info(&self, _raw: &[u8]) -> io::Result<RawFd> {
        let mut state = self.state.lock().unwrap();
        Ok(alloc_fd(&mut state))
    }

    fn map_info(&self, fd: RawFd) -> io::Result<MapInfo> {
        let state = self.state.lock().unwrap();
        state
            .infos
            .get(&fd)
            .cloned()
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EBADF))
    }

    fn pin(&self, fd: RawFd, path: &Path) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        if !state.open_fds.contains(&fd) {
            return Err(io::Error::from_raw_os_error(libc::EBADF));
        }
        state.pins.push((fd, path.to_path_buf()));
        Ok(())
    }

    fn dup_cloexec(&self, fd: RawFd) -> io::Result<RawFd> {
        let mut state = self.state.lock().unwrap();
        if !state.open_fds.contains(&fd) {
            return Err(io::Error::from_raw_os_error(libc::EBADF));
        }
        let new_fd = alloc_fd(&mut state);
        if let Some(info) = state.infos.get(&fd).cloned() {
            state.infos.insert(new_fd, info);
        }
        Ok(new_fd)
    }

    fn close(&self, fd: RawFd) {
        let mut state = self.state.lock().unwrap();
        if !state.open_fds.remove(&fd) {
            state.closed_unknown.push(fd);
        }
    }
}
