//! The map table: definitions discovered through the symbol table of the
//! maps section, creation against the kernel, and descriptor reuse.

use std::os::unix::io::RawFd;

use bitflags::bitflags;
use log::{debug, warn};
use snafu::{ensure, ResultExt};

use crate::btf::TypeInfo;
use crate::error::{InvalidInputSnafu, OsSnafu, Result};
use crate::io::{ReadData, Reader, WriteData, Writer};
use crate::sys::{Kernel, MapCreateAttr};

bitflags! {
    /// Creation flags carried in a map definition.
    #[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapFlags: u32 {
        /// Allocate map entries on demand instead of up front.
        const NO_PREALLOC = 0x1;
        /// Give each CPU its own LRU list instead of a shared one.
        const NO_COMMON_LRU = 0x2;
        /// Honor the numa_node creation field.
        const NUMA_NODE = 0x4;
        /// Reject writes from programs.
        const RDONLY = 0x8;
        /// Reject reads from programs.
        const WRONLY = 0x10;
        /// Stack entries carry build ids instead of raw addresses.
        const STACK_BUILD_ID = 0x20;
    }
}

/// The fixed definition record compiled into the maps section. Objects
/// built against a newer definition may append fields; the tail must be
/// all zero to stay compatible (checked while building the table).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MapDef {
    pub kind: u32,
    pub key_size: u32,
    pub value_size: u32,
    pub max_entries: u32,
    pub flags: MapFlags,
}

impl MapDef {
    pub const SIZE: usize = 20;
}

impl ReadData for MapDef {
    fn read(reader: &mut impl Reader) -> Result<Self> {
        Ok(Self {
            kind: reader.read()?,
            key_size: reader.read()?,
            value_size: reader.read()?,
            max_entries: reader.read()?,
            flags: MapFlags::from_bits_retain(reader.read()?),
        })
    }
}

impl WriteData for &MapDef {
    fn write_to(self, writer: &mut impl Writer) -> Result<()> {
        writer.write(self.kind)?;
        writer.write(self.key_size)?;
        writer.write(self.value_size)?;
        writer.write(self.max_entries)?;
        writer.write(self.flags.bits())?;
        Ok(())
    }
}

/// One map of an object. The descriptor stays `-1` until the map is
/// created at load time or a caller hands one in through reuse.
#[derive(Debug)]
pub struct Map {
    pub(crate) fd: RawFd,
    pub(crate) name: String,
    pub(crate) offset: u64,
    pub(crate) ifindex: u32,
    pub(crate) def: MapDef,
    pub(crate) key_type_id: u32,
    pub(crate) value_type_id: u32,
}

impl Map {
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Byte offset of this map's definition inside the maps section; also
    /// the value relocation symbols carry.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn def(&self) -> &MapDef {
        &self.def
    }

    pub fn key_type_id(&self) -> u32 {
        self.key_type_id
    }

    pub fn value_type_id(&self) -> u32 {
        self.value_type_id
    }

    /// Adopt an existing kernel descriptor for this map: duplicate it
    /// with close-on-exec, take name and definition from what the kernel
    /// reports for it, and drop the previously held descriptor. On any
    /// failure the map is left untouched.
    pub(crate) fn reuse_fd(&mut self, fd: RawFd, kernel: &dyn Kernel) -> Result<()> {
        let info = kernel.map_info(fd).context(OsSnafu { op: "map query" })?;
        let new_fd = kernel
            .dup_cloexec(fd)
            .context(OsSnafu { op: "map descriptor dup" })?;

        if self.fd >= 0 {
            kernel.close(self.fd);
        }
        self.fd = new_fd;
        self.name = info.name;
        self.def = MapDef {
            kind: info.kind,
            key_size: info.key_size,
            value_size: info.value_size,
            max_entries: info.max_entries,
            flags: MapFlags::from_bits_retain(info.flags),
        };
        self.key_type_id = info.key_type_id;
        self.value_type_id = info.value_type_id;
        Ok(())
    }
}

/// Build the map table from the maps section bytes and the symbols that
/// point into it. Every symbol marks one equally-sized definition record;
/// the resulting table is sorted by offset.
pub(crate) fn build_table(entries: Vec<(String, u64)>, data: &[u8]) -> Result<Vec<Map>> {
    if entries.is_empty() {
        return Ok(Vec::new());
    }

    debug!("{} maps in {} bytes", entries.len(), data.len());
    ensure!(
        !data.is_empty() && data.len() % entries.len() == 0,
        InvalidInputSnafu {
            what: format!(
                "unable to determine map definition size: {} maps in {} bytes",
                entries.len(),
                data.len()
            )
        }
    );
    let def_size = data.len() / entries.len();

    let mut maps = Vec::with_capacity(entries.len());
    for (name, offset) in entries {
        ensure!(
            offset as usize + def_size <= data.len(),
            InvalidInputSnafu {
                what: format!("map '{name}' extends past the end of the maps section")
            }
        );
        let record = &data[offset as usize..offset as usize + def_size];

        let def = if def_size <= MapDef::SIZE {
            // Older, shorter definitions: absent fields default to zero.
            let mut padded = [0u8; MapDef::SIZE];
            padded[..def_size].copy_from_slice(record);
            MapDef::read(&mut padded.as_slice())?
        } else {
            // Newer, longer definitions are accepted only when every byte
            // past what this library understands is zero.
            ensure!(
                record[MapDef::SIZE..].iter().all(|&b| b == 0),
                InvalidInputSnafu {
                    what: format!("map '{name}' has unrecognized, non-zero options")
                }
            );
            MapDef::read(&mut &record[..MapDef::SIZE])?
        };

        debug!("map {} is '{}'", maps.len(), name);
        maps.push(Map {
            fd: -1,
            name,
            offset,
            ifindex: 0,
            def,
            key_type_id: 0,
            value_type_id: 0,
        });
    }

    maps.sort_by_key(|m| m.offset);
    ensure!(
        maps.windows(2).all(|w| w[0].offset != w[1].offset),
        InvalidInputSnafu {
            what: "two map definitions share one offset".to_string()
        }
    );
    Ok(maps)
}

/// Create every map that does not already hold a descriptor. When a map
/// has usable type metadata the creation request carries it; a rejection
/// is retried once with the type fields cleared. A terminal failure
/// closes every descriptor this pass opened before the error is returned.
pub(crate) fn create_all(
    maps: &mut [Map],
    type_info: Option<&TypeInfo>,
    kernel: &dyn Kernel,
) -> Result<()> {
    for i in 0..maps.len() {
        if maps[i].fd >= 0 {
            debug!("skip map create (preset) {}: fd={}", maps[i].name, maps[i].fd);
            continue;
        }

        let map = &mut maps[i];
        let mut attr = MapCreateAttr {
            name: &map.name,
            kind: map.def.kind,
            key_size: map.def.key_size,
            value_size: map.def.value_size,
            max_entries: map.def.max_entries,
            flags: map.def.flags.bits(),
            ifindex: map.ifindex,
            type_info_fd: 0,
            key_type_id: 0,
            value_type_id: 0,
        };

        if let Some(info) = type_info {
            match info.map_type_ids(&map.name, map.def.key_size, map.def.value_size) {
                Ok((key_id, value_id)) => {
                    attr.type_info_fd = info.fd() as u32;
                    attr.key_type_id = key_id;
                    attr.value_type_id = value_id;
                    map.key_type_id = key_id;
                    map.value_type_id = value_id;
                }
                Err(err) => debug!("map '{}': no usable type metadata: {err}", map.name),
            }
        }

        let mut created = kernel.create_map(&attr);
        if created.is_err() && attr.key_type_id != 0 {
            warn!(
                "map '{}': creation with type metadata failed ({}), retrying without",
                map.name,
                created.as_ref().unwrap_err()
            );
            attr.type_info_fd = 0;
            attr.key_type_id = 0;
            attr.value_type_id = 0;
            map.key_type_id = 0;
            map.value_type_id = 0;
            created = kernel.create_map(&attr);
        }

        match created {
            Ok(fd) => {
                debug!("created map '{}': fd={fd}", map.name);
                map.fd = fd;
            }
            Err(err) => {
                warn!("failed to create map '{}': {err}", map.name);
                for earlier in &mut maps[..i] {
                    if earlier.fd >= 0 {
                        kernel.close(earlier.fd);
                        earlier.fd = -1;
                    }
                }
                return Err(err).context(OsSnafu { op: "map create" });
            }
        }
    }
    Ok(())
}
