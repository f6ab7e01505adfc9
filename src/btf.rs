//! Type metadata carried in the object's reserved `.BTF` section.
//!
//! The loader only needs enough of the format to enrich map creation:
//! look a named container up, walk to its key/value members, and check
//! their sizes against the map definition. Anything it cannot digest is
//! reported to the caller, who treats missing metadata as non-fatal.

use std::os::unix::io::RawFd;

use log::debug;
use snafu::{ensure, ResultExt};

use crate::error::{FormatSnafu, InvalidInputSnafu, NotFoundSnafu, OsSnafu, Result};
use crate::io::Reader;
use crate::sys::Kernel;

/// Reserved section name holding the type metadata blob.
pub const SECTION_NAME: &str = ".BTF";

const MAGIC: u16 = 0xeb9f;
const VERSION: u8 = 1;
const HDR_LEN: usize = 24;
const MAX_RESOLVE_DEPTH: usize = 32;

const KIND_INT: u32 = 1;
const KIND_PTR: u32 = 2;
const KIND_ARRAY: u32 = 3;
const KIND_STRUCT: u32 = 4;
const KIND_UNION: u32 = 5;
const KIND_ENUM: u32 = 6;
const KIND_FWD: u32 = 7;
const KIND_TYPEDEF: u32 = 8;
const KIND_VOLATILE: u32 = 9;
const KIND_CONST: u32 = 10;
const KIND_RESTRICT: u32 = 11;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Member {
    type_id: u32,
}

#[derive(Debug, Clone)]
enum TypeDesc {
    Void,
    Int { size: u32 },
    Ptr,
    Array { elem: u32, nelems: u32 },
    Struct { size: u32, members: Vec<Member> },
    Union { size: u32, members: Vec<Member> },
    Enum { size: u32 },
    Fwd,
    Ref { referent: u32 },
}

#[derive(Debug, Clone)]
struct Type {
    name_off: u32,
    desc: TypeDesc,
}

/// A parsed type-metadata blob, optionally registered with the kernel.
pub struct TypeInfo {
    raw: Vec<u8>,
    types: Vec<Type>,
    strings: Vec<u8>,
    fd: RawFd,
}

impl TypeInfo {
    pub fn parse(data: &[u8]) -> Result<TypeInfo> {
        let mut reader: &[u8] = data;
        let magic: u16 = reader.read()?;
        ensure!(
            magic == MAGIC,
            FormatSnafu {
                what: format!("bad type metadata magic 0x{magic:x}")
            }
        );
        let version: u8 = reader.read()?;
        ensure!(
            version == VERSION,
            FormatSnafu {
                what: format!("unsupported type metadata version {version}")
            }
        );
        let _flags: u8 = reader.read()?;
        let hdr_len = reader.read::<u32>()? as usize;
        let type_off = reader.read::<u32>()? as usize;
        let type_len = reader.read::<u32>()? as usize;
        let str_off = reader.read::<u32>()? as usize;
        let str_len = reader.read::<u32>()? as usize;
        ensure!(
            hdr_len >= HDR_LEN,
            FormatSnafu {
                what: "type metadata header too short".to_string()
            }
        );

        let mut type_data = header_section(data, hdr_len, type_off, type_len)?;
        let strings = header_section(data, hdr_len, str_off, str_len)?.to_vec();

        let mut types = vec![Type {
            name_off: 0,
            desc: TypeDesc::Void,
        }];
        while !type_data.is_empty() {
            types.push(read_type(&mut type_data)?);
        }

        Ok(TypeInfo {
            raw: data.to_vec(),
            types,
            strings,
            fd: -1,
        })
    }

    /// Register the blob with the kernel so map creation can reference it.
    pub fn load(&mut self, kernel: &dyn Kernel) -> Result<()> {
        if self.fd < 0 {
            self.fd = kernel
                .load_type_info(&self.raw)
                .context(OsSnafu { op: "type metadata load" })?;
        }
        Ok(())
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub(crate) fn release(&mut self, kernel: &dyn Kernel) {
        if self.fd >= 0 {
            kernel.close(self.fd);
            self.fd = -1;
        }
    }

    fn string_at(&self, off: u32) -> Option<&str> {
        let tail = self.strings.get(off as usize..)?;
        let end = tail.iter().position(|&b| b == 0)?;
        std::str::from_utf8(&tail[..end]).ok()
    }

    /// Find a named type, returning its id.
    pub fn find_by_name(&self, name: &str) -> Option<u32> {
        self.types
            .iter()
            .position(|t| self.string_at(t.name_off) == Some(name))
            .map(|idx| idx as u32)
    }

    fn type_by_id(&self, id: u32) -> Result<&Type> {
        self.types.get(id as usize).ok_or_else(|| {
            FormatSnafu {
                what: format!("type metadata references unknown type id {id}"),
            }
            .build()
        })
    }

    /// Byte size of a type, following typedefs, qualifiers and arrays.
    pub fn resolve_size(&self, type_id: u32) -> Result<u32> {
        let mut id = type_id;
        let mut nelems: u64 = 1;

        for _ in 0..MAX_RESOLVE_DEPTH {
            let size = match &self.type_by_id(id)?.desc {
                TypeDesc::Int { size }
                | TypeDesc::Struct { size, .. }
                | TypeDesc::Union { size, .. }
                | TypeDesc::Enum { size } => u64::from(*size),
                TypeDesc::Ptr => std::mem::size_of::<*const ()>() as u64,
                TypeDesc::Array { elem, nelems: n } => {
                    nelems = nelems.saturating_mul(u64::from(*n));
                    id = *elem;
                    continue;
                }
                TypeDesc::Ref { referent } => {
                    id = *referent;
                    continue;
                }
                TypeDesc::Void | TypeDesc::Fwd => {
                    return FormatSnafu {
                        what: format!("type id {id} has no size"),
                    }
                    .fail()
                }
            };
            return u32::try_from(size.saturating_mul(nelems)).map_err(|_| {
                FormatSnafu {
                    what: format!("type id {type_id} is too large"),
                }
                .build()
            });
        }
        FormatSnafu {
            what: format!("type id {type_id} nests too deeply"),
        }
        .fail()
    }

    /// Look up the key/value type ids for a map, checking their resolved
    /// sizes against the declared definition. The compiler emits one
    /// container struct per annotated map, named after the map itself.
    pub fn map_type_ids(
        &self,
        map_name: &str,
        key_size: u32,
        value_size: u32,
    ) -> Result<(u32, u32)> {
        let container_name = format!("____btf_map_{map_name}");
        let container_id = self.find_by_name(&container_name).ok_or_else(|| {
            NotFoundSnafu {
                what: format!("no type metadata container '{container_name}'"),
            }
            .build()
        })?;

        let members = match &self.type_by_id(container_id)?.desc {
            TypeDesc::Struct { members, .. } if members.len() >= 2 => members,
            _ => {
                return InvalidInputSnafu {
                    what: format!("'{container_name}' is not a two-member container struct"),
                }
                .fail()
            }
        };
        let (key, value) = (members[0], members[1]);

        let resolved_key = self.resolve_size(key.type_id)?;
        ensure!(
            resolved_key == key_size,
            InvalidInputSnafu {
                what: format!(
                    "map '{map_name}': metadata key size {resolved_key} != declared {key_size}"
                )
            }
        );
        let resolved_value = self.resolve_size(value.type_id)?;
        ensure!(
            resolved_value == value_size,
            InvalidInputSnafu {
                what: format!(
                    "map '{map_name}': metadata value size {resolved_value} != declared {value_size}"
                )
            }
        );

        debug!(
            "map '{map_name}': type metadata key id {} value id {}",
            key.type_id, value.type_id
        );
        Ok((key.type_id, value.type_id))
    }
}

/// Slice one of the blob's sections; offsets are relative to the end of
/// the header.
fn header_section(data: &[u8], hdr_len: usize, off: usize, len: usize) -> Result<&[u8]> {
    hdr_len
        .checked_add(off)
        .and_then(|start| start.checked_add(len).map(|end| (start, end)))
        .and_then(|(start, end)| data.get(start..end))
        .ok_or_else(|| {
            FormatSnafu {
                what: "type metadata section out of bounds".to_string(),
            }
            .build()
        })
}

fn read_type(reader: &mut &[u8]) -> Result<Type> {
    let name_off: u32 = reader.read()?;
    let info: u32 = reader.read()?;
    let size_or_type: u32 = reader.read()?;
    let vlen = (info & 0xffff) as usize;
    let kind = (info >> 24) & 0xf;

    let desc = match kind {
        KIND_INT => {
            let _encoding: u32 = reader.read()?;
            TypeDesc::Int { size: size_or_type }
        }
        KIND_PTR => TypeDesc::Ptr,
        KIND_ARRAY => {
            let elem: u32 = reader.read()?;
            let _index_type: u32 = reader.read()?;
            let nelems: u32 = reader.read()?;
            TypeDesc::Array { elem, nelems }
        }
        KIND_STRUCT | KIND_UNION => {
            let mut members = Vec::with_capacity(vlen);
            for _ in 0..vlen {
                let _member_name: u32 = reader.read()?;
                let type_id: u32 = reader.read()?;
                let _offset: u32 = reader.read()?;
                members.push(Member { type_id });
            }
            if kind == KIND_STRUCT {
                TypeDesc::Struct {
                    size: size_or_type,
                    members,
                }
            } else {
                TypeDesc::Union {
                    size: size_or_type,
                    members,
                }
            }
        }
        KIND_ENUM => {
            for _ in 0..vlen {
                let _value_name: u32 = reader.read()?;
                let _value: i32 = reader.read()?;
            }
            TypeDesc::Enum { size: size_or_type }
        }
        KIND_FWD => TypeDesc::Fwd,
        KIND_TYPEDEF | KIND_VOLATILE | KIND_CONST | KIND_RESTRICT => TypeDesc::Ref {
            referent: size_or_type,
        },
        _ => {
            return FormatSnafu {
                what: format!("unsupported type metadata kind {kind}"),
            }
            .fail()
        }
    };

    Ok(Type { name_off, desc })
}
