//! Modules: one mapped executable or shared-object image of an address
//! space, together with its lazily materialized ELF image.

use std::ops::Range;
use std::rc::Rc;

use crate::image::{self, Image};
use crate::mem::MemorySource;
use crate::{Error, Result};

/// Content-derived identifier embedded in an ELF note.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildId {
    /// Virtual address of the identifier bytes in the address space.
    pub vaddr: u64,

    /// The identifier, compared by exact byte equality.
    pub bytes: Vec<u8>,
}

/// Which source of truth reported a module.
///
/// Link-map-derived modules are authoritative and take precedence over
/// segment-scan results covering the same address range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleOrigin {
    /// Walked out of the dynamic linker's `r_debug` list.
    LinkMap,

    /// Sniffed from a mapped segment's raw program headers.
    SegmentScan,
}

/// How a module's image is materialized on first use.
pub(crate) enum Backing {
    /// Already materialized.
    Image(Rc<Image>),

    /// Reconstructed from memory on first use.
    Memory {
        /// Address the ELF header is mapped at.
        entry_vaddr: u64,
        /// Page size for segment footprint math.
        page_size: u64,
    },
}

/// One mapped module of an introspection session.
pub struct Module {
    pub(crate) name: String,
    pub(crate) addr_range: Range<u64>,
    pub(crate) bias: u64,
    pub(crate) build_id: Option<BuildId>,
    pub(crate) dynamic_vaddr: Option<u64>,
    pub(crate) is_executable: bool,
    pub(crate) origin: ModuleOrigin,
    pub(crate) backing: Backing,
}

impl Module {
    /// Module name, in decreasing priority: a core-note/link-map path, the
    /// image's `DT_SONAME`, or an `[exe]`/`[pie]`/`[dso]` placeholder.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Address range the module's loadable segments span.
    pub fn addr_range(&self) -> &Range<u64> {
        &self.addr_range
    }

    /// Difference between the module's runtime and link-time addresses.
    pub fn bias(&self) -> u64 {
        self.bias
    }

    /// Build-id found in memory or in the backing file, if any.
    pub fn build_id(&self) -> Option<&BuildId> {
        self.build_id.as_ref()
    }

    /// Runtime address of the module's dynamic segment.
    pub fn dynamic_vaddr(&self) -> Option<u64> {
        self.dynamic_vaddr
    }

    /// Whether the image looks like an executable (carries `DT_DEBUG`).
    pub fn is_executable(&self) -> bool {
        self.is_executable
    }

    /// Which source of truth reported the module.
    pub fn origin(&self) -> ModuleOrigin {
        self.origin
    }

    /// Whether the given address falls inside the module.
    pub fn contains(&self, addr: u64) -> bool {
        self.addr_range.contains(&addr)
    }

    /// The materialized image, if any.
    pub fn image(&self) -> Option<&Rc<Image>> {
        match self.backing {
            Backing::Image(ref image) => Some(image),
            _ => None,
        }
    }

    /// Materializes the module's image, reconstructing it from the given
    /// memory source when it was not captured at registration time.
    pub fn materialize(&mut self, mem: Option<&dyn MemorySource>) -> Result<Rc<Image>> {
        let image = match self.backing {
            Backing::Image(ref image) => return Ok(image.clone()),
            Backing::Memory {
                entry_vaddr,
                page_size,
            } => {
                let mem = mem.ok_or(Error::Unmapped(entry_vaddr))?;

                let (bytes, _) =
                    image::reconstruct(entry_vaddr, page_size, Some(self.bias), mem)?;

                Rc::new(Image::parse(bytes)?)
            }
        };

        tracing::debug!(module = %self.name, "materialized image");

        self.backing = Backing::Image(image.clone());

        Ok(image)
    }
}
