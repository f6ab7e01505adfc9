//! Loader for relocatable VM object files.
//!
//! An object produced by a compiler targeting the in-kernel VM carries
//! programs (one per executable section), map definitions, a license and
//! an optional kernel-version tag. [`Object::open`] parses all of that;
//! [`Object::load`] creates the maps, patches map references and local
//! calls into the byte-code, and submits every program to the kernel
//! verifier. Loaded artifacts can be pinned to the VM filesystem so they
//! outlive the process.
//!
//! ```no_run
//! use bvmload::{Object, ProgramKind};
//!
//! # fn main() -> bvmload::Result<()> {
//! let mut obj = Object::open_for("filter.o", ProgramKind::SocketFilter)?;
//! obj.load()?;
//! for prog in obj.programs() {
//!     println!("{}: fd {}", prog.name(), prog.fd()?);
//! }
//! # Ok(())
//! # }
//! ```

pub mod btf;
pub mod containers;
pub mod error;
pub mod insn;
pub mod io;
pub mod kind;
pub mod obj;
pub mod perf;
pub mod sys;

#[cfg(test)]
pub(crate) mod testutil;

pub use error::{Error, LoadFailReason, Result};
pub use insn::Insn;
pub use kind::{kind_for_section, AttachKind, ProgramKind};
pub use obj::map::{Map, MapDef, MapFlags};
pub use obj::program::{Preprocessor, Program};
pub use obj::{load_file, load_file_with, open_objects, Object};
pub use sys::{Kernel, Sys};
