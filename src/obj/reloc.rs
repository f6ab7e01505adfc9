//! Link-time patching: map descriptors into immediates, and local calls
//! inline-expanded from the text program.

use log::debug;
use snafu::ensure;

use crate::error::{RelocSnafu, Result};
use crate::insn::{self, Insn};
use crate::obj::map::Map;
use crate::obj::program::Program;

/// One relocation anchored to an instruction of its program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reloc {
    /// A 64-bit immediate load whose immediate receives a map descriptor.
    MapFd { insn_idx: usize, map_idx: usize },
    /// A call into the text section, resolved by inlining the callee.
    Call { insn_idx: usize, text_off: u64 },
}

/// Patch every relocation collected for `prog`. `text` carries the text
/// program's instructions when the object has one; `text_shndx` its
/// defining section. Maps must already be created so descriptors exist.
pub(crate) fn apply(
    prog: &mut Program,
    text: Option<&[Insn]>,
    text_shndx: Option<usize>,
    maps: &[Map],
) -> Result<()> {
    for reloc in std::mem::take(&mut prog.relocs) {
        match reloc {
            Reloc::MapFd { insn_idx, map_idx } => {
                ensure!(
                    insn_idx < prog.insns.len(),
                    RelocSnafu {
                        what: format!(
                            "instruction {insn_idx} out of range in '{}'",
                            prog.section_name
                        )
                    }
                );
                prog.insns[insn_idx].set_src_reg(insn::PSEUDO_MAP_FD);
                prog.insns[insn_idx].imm = maps[map_idx].fd();
            }
            Reloc::Call { insn_idx, text_off } => {
                inline_call(prog, text, text_shndx, insn_idx, text_off)?;
            }
        }
    }
    Ok(())
}

fn inline_call(
    prog: &mut Program,
    text: Option<&[Insn]>,
    text_shndx: Option<usize>,
    insn_idx: usize,
    text_off: u64,
) -> Result<()> {
    // A call relocation inside the text program itself cannot be resolved
    // by inlining the text program.
    ensure!(
        text_shndx != Some(prog.shndx),
        RelocSnafu {
            what: format!("call at instruction {insn_idx} into text offset {text_off} from the text section")
        }
    );

    if prog.main_prog_cnt == 0 {
        let text = text.ok_or_else(|| {
            RelocSnafu {
                what: "call into the text section but the object has none".to_string(),
            }
            .build()
        })?;
        prog.main_prog_cnt = prog.insns.len();
        prog.insns.extend_from_slice(text);
        debug!(
            "added {} instructions from the text section to program '{}'",
            text.len(),
            prog.section_name
        );
    }

    let bias = prog.main_prog_cnt as i64 - insn_idx as i64;
    prog.insns[insn_idx].imm += bias as i32;
    Ok(())
}
