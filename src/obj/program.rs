//! The program table: one entry per executable section, its instances,
//! and submission to the kernel verifier.

use std::os::unix::io::RawFd;

use log::{debug, warn};
use snafu::ensure;

use crate::containers::Table;
use crate::error::{
    InternalSnafu, InvalidInputSnafu, LoadFailReason, LoadSnafu, NotFoundSnafu,
    ProgramTooBigSnafu, Result, VerifySnafu, WrongProgramKindSnafu,
};
use crate::insn::{Insn, MAX_INSNS};
use crate::kind::{AttachKind, ProgramKind};
use crate::obj::reloc::Reloc;
use crate::sys::{Kernel, ProgramLoadAttr};

/// A per-program hook producing instruction variants. When installed, the
/// program is submitted once per declared instance; each call either
/// yields the instruction stream for that instance or skips it.
///
/// The hook gets a borrowed view of the program's linked instructions and
/// must return an owned buffer; it cannot retain the view past the call.
pub trait Preprocessor {
    fn prepare(&self, instance: usize, insns: &[Insn]) -> Result<Option<Vec<Insn>>>;
}

/// One program of an object.
pub struct Program {
    /// Index of the defining section, used to anchor relocations.
    pub(crate) shndx: usize,
    pub(crate) name: String,
    pub(crate) section_name: String,
    pub(crate) insns: Table<Insn>,
    /// Original instruction count, recorded when the text program gets
    /// appended for local calls; zero until then.
    pub(crate) main_prog_cnt: usize,
    pub(crate) kind: ProgramKind,
    pub(crate) expected_attach: Option<AttachKind>,
    pub(crate) ifindex: u32,
    pub(crate) relocs: Vec<Reloc>,
    /// `None` means "never loaded"; stored descriptors are `-1` or valid.
    pub(crate) instances: Option<Vec<RawFd>>,
    pub(crate) preprocessor: Option<Box<dyn Preprocessor>>,
}

impl Program {
    pub(crate) fn new(data: &[u8], section_name: &str, shndx: usize) -> Result<Program> {
        ensure!(
            data.len() >= Insn::SIZE,
            InvalidInputSnafu {
                what: format!("corrupted section '{section_name}'")
            }
        );
        let insns = Table::new_linear(&mut &data[..], data.len() / Insn::SIZE)?;

        Ok(Program {
            shndx,
            name: String::new(),
            section_name: section_name.to_string(),
            insns,
            main_prog_cnt: 0,
            kind: ProgramKind::Kprobe,
            expected_attach: None,
            ifindex: 0,
            relocs: Vec::new(),
            instances: None,
            preprocessor: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn section_name(&self) -> &str {
        &self.section_name
    }

    pub fn kind(&self) -> ProgramKind {
        self.kind
    }

    pub fn set_kind(&mut self, kind: ProgramKind) {
        self.kind = kind;
    }

    pub fn expected_attach_kind(&self) -> Option<AttachKind> {
        self.expected_attach
    }

    pub fn set_expected_attach_kind(&mut self, attach: Option<AttachKind>) {
        self.expected_attach = attach;
    }

    pub fn set_ifindex(&mut self, ifindex: u32) {
        self.ifindex = ifindex;
    }

    /// The program's instructions, as currently linked. Empty once the
    /// program has been loaded.
    pub fn insns(&self) -> &[Insn] {
        &self.insns
    }

    /// Number of instances, or `-1` when the program was never loaded.
    pub fn instance_count(&self) -> isize {
        self.instances.as_ref().map_or(-1, |fds| fds.len() as isize)
    }

    /// Descriptor of instance `n`.
    pub fn instance_fd(&self, n: usize) -> Result<RawFd> {
        let fds = self.instances.as_ref().ok_or_else(|| {
            InvalidInputSnafu {
                what: format!("program '{}' is not loaded", self.section_name),
            }
            .build()
        })?;
        let fd = *fds.get(n).ok_or_else(|| {
            InvalidInputSnafu {
                what: format!(
                    "program '{}' has {} instances, no instance {n}",
                    self.section_name,
                    fds.len()
                ),
            }
            .build()
        })?;
        ensure!(
            fd >= 0,
            NotFoundSnafu {
                what: format!("instance {n} of program '{}' was skipped", self.section_name)
            }
        );
        Ok(fd)
    }

    /// Descriptor of the first instance.
    pub fn fd(&self) -> Result<RawFd> {
        self.instance_fd(0)
    }

    /// Install a preprocessor declaring `instances` variants of this
    /// program. Must happen before load.
    pub fn set_preprocessor(
        &mut self,
        instances: usize,
        preprocessor: Box<dyn Preprocessor>,
    ) -> Result<()> {
        ensure!(
            instances > 0,
            InvalidInputSnafu {
                what: "a preprocessor needs at least one instance".to_string()
            }
        );
        ensure!(
            self.instances.is_none(),
            InvalidInputSnafu {
                what: format!(
                    "program '{}' already has instances; set the preprocessor before load",
                    self.section_name
                )
            }
        );

        self.instances = Some(vec![-1; instances]);
        self.preprocessor = Some(preprocessor);
        Ok(())
    }

    pub(crate) fn unload(&mut self, kernel: &dyn Kernel) {
        if let Some(fds) = self.instances.take() {
            for fd in fds {
                if fd >= 0 {
                    kernel.close(fd);
                }
            }
        }
    }

    /// Submit this program. The instruction buffer is released afterwards
    /// whether or not submission succeeded: on failure the whole object is
    /// torn down, on success the program lives on as descriptors only.
    pub(crate) fn load(
        &mut self,
        license: &str,
        kernel_version: u32,
        kernel: &dyn Kernel,
    ) -> Result<()> {
        let result = self.load_instances(license, kernel_version, kernel);
        self.insns = Table::new();
        if result.is_err() {
            warn!("failed to load program '{}'", self.section_name);
        }
        result
    }

    fn load_instances(
        &mut self,
        license: &str,
        kernel_version: u32,
        kernel: &dyn Kernel,
    ) -> Result<()> {
        if self.instances.is_none() {
            ensure!(
                self.preprocessor.is_none(),
                InternalSnafu {
                    what: format!(
                        "program '{}' has a preprocessor but no instances",
                        self.section_name
                    )
                }
            );
            self.instances = Some(vec![-1]);
        }

        let Some(preprocessor) = &self.preprocessor else {
            let fd = submit(
                kernel,
                self.kind,
                self.expected_attach,
                &self.name,
                &self.insns,
                license,
                kernel_version,
                self.ifindex,
            )?;
            self.instances.as_mut().unwrap()[0] = fd;
            return Ok(());
        };

        for n in 0..self.instances.as_ref().unwrap().len() {
            let prepared = preprocessor.prepare(n, &self.insns)?;
            let Some(prepared) = prepared.filter(|insns| !insns.is_empty()) else {
                debug!(
                    "skip loading instance {n} of program '{}'",
                    self.section_name
                );
                continue;
            };
            let fd = submit(
                kernel,
                self.kind,
                self.expected_attach,
                &self.name,
                &prepared,
                license,
                kernel_version,
                self.ifindex,
            )?;
            self.instances.as_mut().unwrap()[n] = fd;
        }
        Ok(())
    }
}

/// One submission, with the failure classified: a verifier log means
/// `Verify`, hitting the instruction ceiling means `ProgramTooBig`, and
/// otherwise a probe re-submission as a plain kprobe tells a wrongly
/// declared kind apart from a kernel that rejects the program entirely.
#[allow(clippy::too_many_arguments)]
fn submit(
    kernel: &dyn Kernel,
    kind: ProgramKind,
    expected_attach: Option<AttachKind>,
    name: &str,
    insns: &[Insn],
    license: &str,
    kernel_version: u32,
    ifindex: u32,
) -> Result<RawFd> {
    ensure!(
        !insns.is_empty(),
        InvalidInputSnafu {
            what: format!("program '{name}' has no instructions")
        }
    );

    let attr = ProgramLoadAttr {
        kind,
        expected_attach,
        name,
        insns,
        license,
        kernel_version,
        ifindex,
    };
    let mut log = String::new();

    let err = match kernel.load_program(&attr, Some(&mut log)) {
        Ok(fd) => return Ok(fd),
        Err(err) => err,
    };
    warn!("load program '{name}' failed: {err}");

    if !log.is_empty() {
        warn!("-- BEGIN DUMP LOG ---\n{log}\n-- END LOG --");
        return VerifySnafu { name, log }.fail();
    }

    if insns.len() >= MAX_INSNS {
        warn!(
            "program '{name}' too large ({} insns), at most {MAX_INSNS} insns",
            insns.len()
        );
        return ProgramTooBigSnafu {
            name,
            count: insns.len(),
        }
        .fail();
    }

    if kind != ProgramKind::Kprobe {
        let probe = ProgramLoadAttr {
            kind: ProgramKind::Kprobe,
            expected_attach: None,
            ..attr
        };
        if let Ok(fd) = kernel.load_program(&probe, None) {
            kernel.close(fd);
            return WrongProgramKindSnafu { name }.fail();
        }
    }

    LoadSnafu {
        name,
        reason: LoadFailReason::KernelMismatch,
    }
    .fail()
}
