//! The object-file pipeline: open a relocatable VM object, discover its
//! maps and programs, create the maps, patch the byte-code and submit
//! every program to the kernel verifier.

pub mod map;
pub mod program;
pub mod reloc;

use std::ffi::CString;
use std::fs;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::DirBuilderExt;
use std::os::unix::io::RawFd;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use goblin::elf::{header, section_header, sym, Elf};
use log::{debug, warn};
use snafu::{ensure, ResultExt};

use crate::btf::{self, TypeInfo};
use crate::error::{
    EndianSnafu, FormatSnafu, InternalSnafu, InvalidInputSnafu, MissingKernelVersionSnafu,
    NameTooLongSnafu, NotFoundSnafu, OsSnafu, ReaderSnafu, RelocSnafu, Result,
};
use crate::insn::{self, Insn};
use crate::kind::{self, ProgramKind};
use crate::obj::map::Map;
use crate::obj::program::Program;
use crate::obj::reloc::Reloc;
use crate::sys::{Kernel, Sys};

/// Machine id of VM objects; legacy compilers leave the field at none.
const MACHINE_BVM: u16 = 247;
/// Filesystem magic of the pinning mount.
const FS_MAGIC: u64 = 0xcafe_4a11;
/// The license string is capped at 63 bytes plus terminator.
const LICENSE_MAX: usize = 63;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);
static OPEN_OBJECTS: Mutex<Vec<(u64, String)>> = Mutex::new(Vec::new());

/// Names of every object currently open in this process. The list itself
/// is guarded, but objects stay single-owner: mutating an object is the
/// caller's to serialize.
pub fn open_objects() -> Vec<String> {
    let open = OPEN_OBJECTS
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    open.iter().map(|(_, name)| name.clone()).collect()
}

/// A relocatable object and everything discovered inside it. Dropping the
/// object releases every descriptor it still owns.
pub struct Object {
    id: u64,
    name: String,
    license: String,
    kernel_version: u32,
    maps: Vec<Map>,
    programs: Vec<Program>,
    type_info: Option<TypeInfo>,
    loaded: bool,
    has_local_calls: bool,
    text_shndx: Option<usize>,
    kernel: Arc<dyn Kernel>,
}

impl std::fmt::Debug for Object {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Object")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("license", &self.license)
            .field("kernel_version", &self.kernel_version)
            .field("maps", &self.maps.len())
            .field("programs", &self.programs.len())
            .field("type_info", &self.type_info.is_some())
            .field("loaded", &self.loaded)
            .field("has_local_calls", &self.has_local_calls)
            .field("text_shndx", &self.text_shndx)
            .finish()
    }
}

/// Section indices that only matter while parsing.
#[derive(Default)]
struct ParseState {
    maps_shndx: Option<usize>,
    strtab_idx: usize,
    has_symtab: bool,
    /// (relocation section index, target section index)
    relocs: Vec<(usize, usize)>,
}

impl Object {
    pub fn open(path: impl AsRef<Path>) -> Result<Object> {
        Self::open_with(path, ProgramKind::Unspec, Arc::new(Sys))
    }

    /// Open for a known program kind; whether a kernel-version tag is
    /// required follows from the kind.
    pub fn open_for(path: impl AsRef<Path>, kind: ProgramKind) -> Result<Object> {
        Self::open_with(path, kind, Arc::new(Sys))
    }

    pub fn open_with(
        path: impl AsRef<Path>,
        kind: ProgramKind,
        kernel: Arc<dyn Kernel>,
    ) -> Result<Object> {
        let path = path.as_ref();
        let bytes = fs::read(path).context(OsSnafu {
            op: "read object file",
        })?;
        Self::from_bytes(
            &bytes,
            &path.display().to_string(),
            kind.needs_kernel_version(),
            kernel,
        )
    }

    /// Open an object held in memory. `name` stands in for the path.
    pub fn open_buffer(bytes: &[u8], name: &str) -> Result<Object> {
        Self::open_buffer_with(bytes, name, ProgramKind::Unspec, Arc::new(Sys))
    }

    pub fn open_buffer_with(
        bytes: &[u8],
        name: &str,
        kind: ProgramKind,
        kernel: Arc<dyn Kernel>,
    ) -> Result<Object> {
        ensure!(
            !bytes.is_empty() && !name.is_empty(),
            InvalidInputSnafu {
                what: "an object buffer and a name are required".to_string()
            }
        );
        Self::from_bytes(bytes, name, kind.needs_kernel_version(), kernel)
    }

    fn from_bytes(
        bytes: &[u8],
        name: &str,
        needs_kver: bool,
        kernel: Arc<dyn Kernel>,
    ) -> Result<Object> {
        debug!("loading object '{name}'");
        let elf = Elf::parse(bytes).context(ReaderSnafu)?;

        ensure!(
            elf.header.e_type == header::ET_REL
                && (elf.header.e_machine == 0 || elf.header.e_machine == MACHINE_BVM),
            FormatSnafu {
                what: format!("{name} is not a VM object file")
            }
        );
        ensure!(elf.little_endian == cfg!(target_endian = "little"), EndianSnafu);

        let mut obj = Object {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            name: name.to_string(),
            license: String::new(),
            kernel_version: 0,
            maps: Vec::new(),
            programs: Vec::new(),
            type_info: None,
            loaded: false,
            has_local_calls: false,
            text_shndx: None,
            kernel,
        };

        let state = obj.collect_sections(&elf, bytes)?;
        obj.init_maps(&elf, &state, bytes)?;
        obj.init_program_names(&elf)?;
        obj.collect_relocs(&elf, &state)?;
        if needs_kver && obj.kernel_version == 0 {
            warn!("{name} doesn't provide kernel version");
            return MissingKernelVersionSnafu.fail();
        }

        let mut open = OPEN_OBJECTS
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        open.push((obj.id, obj.name.clone()));
        drop(open);
        Ok(obj)
    }

    /// One sweep over all sections, classifying each by its reserved name
    /// or type.
    fn collect_sections(&mut self, elf: &Elf<'_>, bytes: &[u8]) -> Result<ParseState> {
        let mut state = ParseState::default();

        for (idx, sh) in elf.section_headers.iter().enumerate() {
            if idx == 0 {
                continue;
            }
            let name = elf.shdr_strtab.get_at(sh.sh_name).ok_or_else(|| {
                FormatSnafu {
                    what: format!("failed to get section({idx}) name"),
                }
                .build()
            })?;
            let data = section_data(sh, bytes)?;
            debug!(
                "section({idx}) {name}, size {}, link {}, flags {:#x}, type={}",
                data.len(),
                sh.sh_link,
                sh.sh_flags,
                sh.sh_type
            );

            if name == "license" {
                self.init_license(data);
            } else if name == "version" {
                self.init_kernel_version(data)?;
            } else if name == "maps" {
                state.maps_shndx = Some(idx);
            } else if name == btf::SECTION_NAME {
                self.init_type_info(data);
            } else if sh.sh_type == section_header::SHT_SYMTAB {
                ensure!(
                    !state.has_symtab,
                    FormatSnafu {
                        what: format!("multiple symbol tables in {}", self.name)
                    }
                );
                state.has_symtab = true;
                state.strtab_idx = sh.sh_link as usize;
            } else if sh.sh_type == section_header::SHT_PROGBITS
                && sh.sh_flags & u64::from(section_header::SHF_EXECINSTR) != 0
                && !data.is_empty()
            {
                if name == ".text" {
                    self.text_shndx = Some(idx);
                }
                debug!("found program {name}");
                self.programs.push(Program::new(data, name, idx)?);
            } else if sh.sh_type == section_header::SHT_REL {
                let target = sh.sh_info as usize;
                if section_is_exec(elf, target) {
                    state.relocs.push((idx, target));
                } else {
                    debug!("skip relo {name}({idx}) for section({target})");
                }
            } else {
                debug!("skip section({idx}) {name}");
            }
        }

        ensure!(
            state.strtab_idx != 0 && state.strtab_idx < elf.section_headers.len(),
            FormatSnafu {
                what: "corrupted object: index of string table invalid".to_string()
            }
        );
        Ok(state)
    }

    fn init_license(&mut self, data: &[u8]) {
        let raw = &data[..data.len().min(LICENSE_MAX)];
        let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        self.license = String::from_utf8_lossy(&raw[..end]).into_owned();
        debug!("license of {} is {}", self.name, self.license);
    }

    fn init_kernel_version(&mut self, data: &[u8]) -> Result<()> {
        let tag: [u8; 4] = data.try_into().map_err(|_| {
            FormatSnafu {
                what: format!("invalid kernel-version section in {}", self.name),
            }
            .build()
        })?;
        self.kernel_version = u32::from_ne_bytes(tag);
        debug!(
            "kernel version of {} is {:x}",
            self.name, self.kernel_version
        );
        Ok(())
    }

    /// Type metadata is best effort: an object with a section this library
    /// (or the kernel) cannot digest still loads, just without it.
    fn init_type_info(&mut self, data: &[u8]) {
        match TypeInfo::parse(data) {
            Ok(mut info) => match info.load(self.kernel.as_ref()) {
                Ok(()) => self.type_info = Some(info),
                Err(err) => {
                    warn!("failed to register type metadata: {err}. Ignored and continue.")
                }
            },
            Err(err) => {
                warn!(
                    "error loading section {}: {err}. Ignored and continue.",
                    btf::SECTION_NAME
                )
            }
        }
    }

    fn init_maps(&mut self, elf: &Elf<'_>, state: &ParseState, bytes: &[u8]) -> Result<()> {
        let Some(maps_shndx) = state.maps_shndx else {
            return Ok(());
        };
        let data = section_data(&elf.section_headers[maps_shndx], bytes)?;

        let mut entries = Vec::new();
        for s in elf.syms.iter() {
            if s.st_shndx != maps_shndx {
                continue;
            }
            let name = elf.strtab.get_at(s.st_name).ok_or_else(|| {
                FormatSnafu {
                    what: "failed to get map symbol name".to_string(),
                }
                .build()
            })?;
            entries.push((name.to_string(), s.st_value));
        }

        self.maps = map::build_table(entries, data)?;
        Ok(())
    }

    /// Every program is named after the global symbol defined in its
    /// section; the text program falls back to the section name itself.
    fn init_program_names(&mut self, elf: &Elf<'_>) -> Result<()> {
        for prog in &mut self.programs {
            let mut name = None;
            for s in elf.syms.iter() {
                if s.st_shndx != prog.shndx || s.st_bind() != sym::STB_GLOBAL {
                    continue;
                }
                let sym_name = elf.strtab.get_at(s.st_name).ok_or_else(|| {
                    FormatSnafu {
                        what: format!(
                            "failed to get symbol name for program '{}'",
                            prog.section_name
                        ),
                    }
                    .build()
                })?;
                name = Some(sym_name.to_string());
                break;
            }
            if name.is_none() && Some(prog.shndx) == self.text_shndx {
                name = Some(".text".to_string());
            }
            prog.name = name.ok_or_else(|| {
                InvalidInputSnafu {
                    what: format!("no symbol found for program '{}'", prog.section_name),
                }
                .build()
            })?;
        }
        Ok(())
    }

    /// Decode every pending relocation table and anchor its entries to the
    /// program defined in the section it targets.
    fn collect_relocs(&mut self, elf: &Elf<'_>, state: &ParseState) -> Result<()> {
        for &(rel_idx, target) in &state.relocs {
            let prog_pos = self
                .programs
                .iter()
                .position(|p| p.shndx == target)
                .ok_or_else(|| {
                    RelocSnafu {
                        what: format!("relocation failed: no program in section({target})"),
                    }
                    .build()
                })?;
            let rels = elf
                .shdr_relocs
                .iter()
                .find(|(idx, _)| *idx == rel_idx)
                .map(|(_, rels)| rels)
                .ok_or_else(|| {
                    InternalSnafu {
                        what: format!("relocation section({rel_idx}) was not decoded"),
                    }
                    .build()
                })?;

            debug!(
                "collecting relocations for '{}'",
                self.programs[prog_pos].section_name
            );
            let mut descs = Vec::with_capacity(rels.len());
            for rel in rels.iter() {
                let s = elf.syms.get(rel.r_sym).ok_or_else(|| {
                    FormatSnafu {
                        what: format!("relocation references unknown symbol {}", rel.r_sym),
                    }
                    .build()
                })?;
                ensure!(
                    Some(s.st_shndx) == state.maps_shndx || Some(s.st_shndx) == self.text_shndx,
                    RelocSnafu {
                        what: format!(
                            "program '{}' has a relocation pointing at section {}",
                            self.programs[prog_pos].section_name, s.st_shndx
                        )
                    }
                );

                let insn_idx = (rel.r_offset / Insn::SIZE as u64) as usize;
                let prog = &self.programs[prog_pos];
                ensure!(
                    insn_idx < prog.insns.len(),
                    RelocSnafu {
                        what: format!(
                            "relocation at instruction {insn_idx} past the end of '{}'",
                            prog.section_name
                        )
                    }
                );
                let patched = prog.insns[insn_idx];

                if patched.is_call() {
                    ensure!(
                        patched.src_reg() == insn::PSEUDO_CALL,
                        RelocSnafu {
                            what: format!("incorrect call opcode at instruction {insn_idx}")
                        }
                    );
                    descs.push(Reloc::Call {
                        insn_idx,
                        text_off: s.st_value,
                    });
                    self.has_local_calls = true;
                } else {
                    ensure!(
                        patched.is_ld_imm64(),
                        RelocSnafu {
                            what: format!(
                                "invalid relocation for instruction {insn_idx} code {:#x}",
                                patched.code
                            )
                        }
                    );
                    let map_idx = self
                        .maps
                        .iter()
                        .position(|m| m.offset == s.st_value)
                        .ok_or_else(|| {
                            RelocSnafu {
                                what: format!(
                                    "no map at offset {} for instruction {insn_idx}",
                                    s.st_value
                                ),
                            }
                            .build()
                        })?;
                    debug!("relocation: found map {map_idx} for instruction {insn_idx}");
                    descs.push(Reloc::MapFd { insn_idx, map_idx });
                }
            }
            self.programs[prog_pos].relocs = descs;
        }
        Ok(())
    }

    /// Create maps, patch relocations, submit programs. A failure in any
    /// stage tears everything back down: no descriptor outlives the error.
    pub fn load(&mut self) -> Result<()> {
        ensure!(
            !self.loaded,
            InvalidInputSnafu {
                what: format!("object '{}' should not be loaded twice", self.name)
            }
        );
        self.loaded = true;

        let result = self.load_inner();
        if result.is_err() {
            self.unload();
            warn!("failed to load object '{}'", self.name);
        }
        result
    }

    fn load_inner(&mut self) -> Result<()> {
        map::create_all(&mut self.maps, self.type_info.as_ref(), self.kernel.as_ref())?;
        self.relocate_all()?;
        self.load_programs()
    }

    fn relocate_all(&mut self) -> Result<()> {
        for i in 0..self.programs.len() {
            // The inlined copy reflects the text program as it stands when
            // this program is patched.
            let text = if self.has_local_calls {
                self.text_shndx
                    .and_then(|shndx| self.programs.iter().find(|p| p.shndx == shndx))
                    .map(|p| p.insns.0.clone())
            } else {
                None
            };
            if let Err(err) = reloc::apply(
                &mut self.programs[i],
                text.as_deref(),
                self.text_shndx,
                &self.maps,
            ) {
                warn!("failed to relocate '{}'", self.programs[i].section_name);
                return Err(err);
            }
        }
        Ok(())
    }

    fn load_programs(&mut self) -> Result<()> {
        for i in 0..self.programs.len() {
            if self.is_function_storage(i) {
                continue;
            }
            self.programs[i].load(&self.license, self.kernel_version, self.kernel.as_ref())?;
        }
        Ok(())
    }

    /// The text program is only a source of inlined bodies when the
    /// object has local calls; it is never submitted on its own then.
    fn is_function_storage(&self, index: usize) -> bool {
        self.has_local_calls && Some(self.programs[index].shndx) == self.text_shndx
    }

    /// Close every map descriptor and every program instance descriptor.
    pub fn unload(&mut self) {
        for m in &mut self.maps {
            if m.fd >= 0 {
                self.kernel.close(m.fd);
                m.fd = -1;
            }
        }
        for prog in &mut self.programs {
            prog.unload(self.kernel.as_ref());
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn license(&self) -> &str {
        &self.license
    }

    pub fn kernel_version(&self) -> u32 {
        self.kernel_version
    }

    /// Descriptor of the registered type metadata, `-1` when absent.
    pub fn type_info_fd(&self) -> RawFd {
        self.type_info.as_ref().map_or(-1, TypeInfo::fd)
    }

    pub fn maps(&self) -> &[Map] {
        &self.maps
    }

    pub fn find_map_by_name(&self, name: &str) -> Option<usize> {
        self.maps.iter().position(|m| m.name == name)
    }

    pub fn find_map_by_offset(&self, offset: u64) -> Option<usize> {
        self.maps.iter().position(|m| m.offset == offset)
    }

    pub fn set_map_ifindex(&mut self, index: usize, ifindex: u32) -> Result<()> {
        let m = self.map_entry_mut(index)?;
        m.ifindex = ifindex;
        Ok(())
    }

    /// Hand map `index` an existing kernel descriptor instead of creating
    /// one at load time. See [`Map::reuse_fd`] for the exchange rules.
    pub fn reuse_map_fd(&mut self, index: usize, fd: RawFd) -> Result<()> {
        let kernel = Arc::clone(&self.kernel);
        let m = self.map_entry_mut(index)?;
        m.reuse_fd(fd, kernel.as_ref())
    }

    fn map_entry_mut(&mut self, index: usize) -> Result<&mut Map> {
        let count = self.maps.len();
        self.maps.get_mut(index).ok_or_else(|| {
            NotFoundSnafu {
                what: format!("map {index} of {count}"),
            }
            .build()
        })
    }

    /// The object's programs, skipping the text program when it only
    /// stores functions for inlining.
    pub fn programs(&self) -> impl Iterator<Item = &Program> {
        let text_shndx = self.text_shndx;
        let has_local_calls = self.has_local_calls;
        self.programs
            .iter()
            .filter(move |p| !(has_local_calls && Some(p.shndx) == text_shndx))
    }

    pub fn program(&self, index: usize) -> Option<&Program> {
        self.programs.get(index)
    }

    pub fn program_mut(&mut self, index: usize) -> Option<&mut Program> {
        self.programs.get_mut(index)
    }

    pub fn find_program_by_section(&self, section_name: &str) -> Option<usize> {
        self.programs
            .iter()
            .position(|p| p.section_name == section_name)
    }

    /// Pin one program instance at `path` on the pinning filesystem.
    pub fn pin_program_instance(
        &self,
        index: usize,
        path: impl AsRef<Path>,
        instance: usize,
    ) -> Result<()> {
        let path = path.as_ref();
        check_path(path)?;
        let prog = self.program_entry(index)?;
        let fd = prog.instance_fd(instance)?;
        self.kernel
            .pin(fd, path)
            .context(OsSnafu { op: "pin program" })?;
        debug!("pinned program '{}'", path.display());
        Ok(())
    }

    /// Pin every instance of a program under directory `path`, one file
    /// per instance index.
    pub fn pin_program(&self, index: usize, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        check_path(path)?;
        let prog = self.program_entry(index)?;
        ensure!(
            prog.instance_count() > 0,
            InvalidInputSnafu {
                what: format!("no instances of program '{}' to pin", prog.section_name)
            }
        );

        make_dir(path)?;
        for instance in 0..prog.instance_count() as usize {
            self.pin_program_instance(index, path.join(instance.to_string()), instance)?;
        }
        Ok(())
    }

    pub fn pin_map(&self, index: usize, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        check_path(path)?;
        let m = self.maps.get(index).ok_or_else(|| {
            NotFoundSnafu {
                what: format!("map {index} of {}", self.maps.len()),
            }
            .build()
        })?;
        self.kernel
            .pin(m.fd, path)
            .context(OsSnafu { op: "pin map" })?;
        debug!("pinned map '{}'", path.display());
        Ok(())
    }

    /// Pin every map (by name) and every program (by section name, one
    /// file per instance) under directory `path`.
    pub fn pin(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        ensure!(
            self.loaded,
            NotFoundSnafu {
                what: "object not yet loaded; load it first".to_string()
            }
        );

        make_dir(path)?;
        for (index, m) in self.maps.iter().enumerate() {
            self.pin_map(index, path.join(&m.name))?;
        }
        for index in 0..self.programs.len() {
            if self.is_function_storage(index) {
                continue;
            }
            self.pin_program(index, path.join(&self.programs[index].section_name))?;
        }
        Ok(())
    }

    fn program_entry(&self, index: usize) -> Result<&Program> {
        self.programs.get(index).ok_or_else(|| {
            NotFoundSnafu {
                what: format!("program {index} of {}", self.programs.len()),
            }
            .build()
        })
    }
}

impl Drop for Object {
    fn drop(&mut self) {
        self.unload();
        if let Some(info) = &mut self.type_info {
            info.release(self.kernel.as_ref());
        }
        let mut open = OPEN_OBJECTS
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        open.retain(|(id, _)| *id != self.id);
    }
}

/// Open an object, infer each program's kind from its section name when
/// `kind` is unspecified, load everything and return the object together
/// with the first program's descriptor.
pub fn load_file(path: impl AsRef<Path>, kind: ProgramKind) -> Result<(Object, RawFd)> {
    load_file_with(path, kind, Arc::new(Sys))
}

pub fn load_file_with(
    path: impl AsRef<Path>,
    kind: ProgramKind,
    kernel: Arc<dyn Kernel>,
) -> Result<(Object, RawFd)> {
    let mut obj = Object::open_with(path, kind, kernel)?;

    let mut first = None;
    for i in 0..obj.programs.len() {
        let (prog_kind, attach) = if kind == ProgramKind::Unspec {
            let section_name = &obj.programs[i].section_name;
            kind::kind_for_section(section_name).map_err(|err| {
                warn!("failed to guess program kind based on section name {section_name}");
                err
            })?
        } else {
            (kind, None)
        };
        obj.programs[i].kind = prog_kind;
        obj.programs[i].expected_attach = attach;
        if first.is_none() && !obj.is_function_storage(i) {
            first = Some(i);
        }
    }
    let first = first.ok_or_else(|| {
        NotFoundSnafu {
            what: "object file doesn't contain a program".to_string(),
        }
        .build()
    })?;

    obj.load()?;
    let fd = obj.programs[first].fd()?;
    Ok((obj, fd))
}

fn section_data<'a>(
    sh: &section_header::SectionHeader,
    bytes: &'a [u8],
) -> Result<&'a [u8]> {
    let range = sh.file_range().unwrap_or(0..0);
    bytes.get(range).ok_or_else(|| {
        FormatSnafu {
            what: "section data out of bounds".to_string(),
        }
        .build()
    })
}

fn section_is_exec(elf: &Elf<'_>, idx: usize) -> bool {
    elf.section_headers
        .get(idx)
        .map(|sh| sh.sh_flags & u64::from(section_header::SHF_EXECINSTR) != 0)
        .unwrap_or(false)
}

/// The pinning mount is recognized by its filesystem magic; anything else
/// is refused before touching the kernel.
fn check_path(path: &Path) -> Result<()> {
    ensure!(
        path.as_os_str().len() < libc::PATH_MAX as usize,
        NameTooLongSnafu {
            path: path.display().to_string()
        }
    );
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let cdir = CString::new(dir.as_os_str().as_bytes()).map_err(|_| {
        InvalidInputSnafu {
            what: format!("bad pin path {}", path.display()),
        }
        .build()
    })?;

    let mut st: libc::statfs = unsafe { std::mem::zeroed() };
    let ret = unsafe { libc::statfs(cdir.as_ptr(), &mut st) };
    if ret != 0 {
        return Err(std::io::Error::last_os_error()).context(OsSnafu { op: "statfs" });
    }
    ensure!(
        st.f_type as u64 == FS_MAGIC,
        InvalidInputSnafu {
            what: format!("specified path {} is not on the VM filesystem", path.display())
        }
    );
    Ok(())
}

fn make_dir(path: &Path) -> Result<()> {
    let mut builder = fs::DirBuilder::new();
    builder.mode(0o700);
    match builder.create(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
        Err(err) => {
            warn!("failed to mkdir {}: {err}", path.display());
            Err(err).context(OsSnafu { op: "mkdir" })
        }
    }
}
