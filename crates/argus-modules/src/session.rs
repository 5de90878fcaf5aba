//! Introspection sessions.
//!
//! A [Session] owns every piece of mutable state one introspection run
//! accumulates: the registered modules, their materialized images, and the
//! disjoint-range index guarding them. One session per thread; nothing in
//! this crate is process-global.

use std::rc::Rc;

use indexmap::IndexMap;
use rangemap::RangeMap;

use crate::image::Image;
use crate::mem::MemorySource;
use crate::module::{Backing, Module, ModuleOrigin};
use crate::{Error, Result};

/// Stable handle to a module registered in a [Session].
pub type ModuleId = u32;

/// What happened to a module handed to [Session::insert].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The module was registered under the given id.
    Added(ModuleId),

    /// The module replaced one or more segment-scan results covering the
    /// same range (link-map precedence).
    Replaced(ModuleId),

    /// The module overlapped an existing, equally or more authoritative
    /// module and was dropped.
    Rejected,
}

/// One address-space introspection session.
#[derive(Default)]
pub struct Session {
    modules: IndexMap<ModuleId, Module>,
    ranges: RangeMap<u64, ModuleId>,
    next_id: ModuleId,
}

impl Session {
    /// Creates an empty session.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registered modules, in registration order.
    pub fn modules(&self) -> impl Iterator<Item = (ModuleId, &Module)> {
        self.modules.iter().map(|(id, module)| (*id, module))
    }

    /// Number of registered modules.
    pub fn module_count(&self) -> usize {
        self.modules.len()
    }

    /// Module registered under the given id.
    pub fn module(&self, id: ModuleId) -> Option<&Module> {
        self.modules.get(&id)
    }

    /// Module whose address range contains `addr`.
    pub fn module_at(&self, addr: u64) -> Option<(ModuleId, &Module)> {
        let id = *self.ranges.get(&addr)?;
        self.modules.get(&id).map(|module| (id, module))
    }

    /// First module with the given name.
    pub fn module_by_name(&self, name: &str) -> Option<(ModuleId, &Module)> {
        self.modules
            .iter()
            .find(|(_, module)| module.name() == name)
            .map(|(id, module)| (*id, module))
    }

    /// Registers a module, enforcing range disjointness.
    ///
    /// Distinct modules never overlap: a link-map-derived module replaces
    /// overlapping segment-scan results, any other overlap is rejected.
    pub fn insert(&mut self, module: Module) -> Result<InsertOutcome> {
        let range = module.addr_range.clone();

        if range.start >= range.end {
            return Err(Error::BadImage("empty module range"));
        }

        let overlapping = self
            .ranges
            .overlapping(&range)
            .map(|(_, id)| *id)
            .collect::<Vec<_>>();

        let replaced = !overlapping.is_empty();

        if replaced {
            let authoritative = module.origin == ModuleOrigin::LinkMap
                && overlapping.iter().all(|id| {
                    self.modules
                        .get(id)
                        .is_none_or(|old| old.origin == ModuleOrigin::SegmentScan)
                });

            if !authoritative {
                tracing::debug!(
                    module = %module.name,
                    start = format_args!("{:#x}", range.start),
                    "dropping module overlapping an authoritative one"
                );

                return Ok(InsertOutcome::Rejected);
            }

            for id in overlapping {
                if let Some(old) = self.modules.shift_remove(&id) {
                    tracing::debug!(
                        old = %old.name,
                        new = %module.name,
                        "link map replaces scanned module"
                    );

                    self.ranges.remove(old.addr_range.clone());
                }
            }
        }

        let id = self.next_id;
        self.next_id += 1;

        tracing::debug!(
            module = %module.name,
            range = format_args!("{:#x}..{:#x}", range.start, range.end),
            bias = format_args!("{:#x}", module.bias),
            "registered module"
        );

        self.ranges.insert(range, id);
        self.modules.insert(id, module);

        Ok(if replaced {
            InsertOutcome::Replaced(id)
        } else {
            InsertOutcome::Added(id)
        })
    }

    /// Materializes (and memoizes) the image backing the given module.
    ///
    /// `mem` is only consulted when the module must be reconstructed from
    /// memory; file-backed modules read from disk.
    pub fn module_image(
        &mut self,
        id: ModuleId,
        mem: Option<&dyn MemorySource>,
    ) -> Result<Rc<Image>> {
        self.modules
            .get_mut(&id)
            .ok_or(Error::BadImage("unknown module id"))?
            .materialize(mem)
    }

    /// Returns the runtime address of the given symbol, searching every
    /// registered module.
    pub fn addr_of_symbol(
        &mut self,
        symbol: &str,
        mem: Option<&dyn MemorySource>,
    ) -> Option<u64> {
        let ids = self.modules.keys().copied().collect::<Vec<_>>();

        for id in ids {
            let Some(module) = self.modules.get_mut(&id) else {
                continue;
            };

            let bias = module.bias;

            let image = match module.materialize(mem) {
                Ok(image) => image,
                Err(e) => {
                    tracing::warn!(error = %e, "skipping module without image");
                    continue;
                }
            };

            let found = image
                .symbols()
                .iter()
                .find(|sym| sym.section != 0 && sym.name == symbol)
                .map(|sym| bias.wrapping_add(sym.value));

            if found.is_some() {
                return found;
            }
        }

        None
    }

    /// Returns the closest symbol at or below the given address, along
    /// with the offset from the symbol's start.
    pub fn symbol_of_addr(
        &mut self,
        addr: u64,
        mem: Option<&dyn MemorySource>,
    ) -> Option<(String, u64)> {
        let (id, module) = self.module_at(addr)?;
        let bias = module.bias;

        let image = match self.modules.get_mut(&id)?.materialize(mem) {
            Ok(image) => image,
            Err(e) => {
                tracing::warn!(error = %e, "module image unavailable");
                return None;
            }
        };

        let rela = addr.checked_sub(bias)?;

        image
            .symbols()
            .iter()
            .filter(|sym| sym.section != 0 && !sym.name.is_empty() && sym.value <= rela)
            .filter(|sym| sym.size == 0 || rela < sym.value.saturating_add(sym.size))
            .max_by_key(|sym| sym.value)
            .map(|sym| (sym.name.clone(), rela - sym.value))
    }

    /// Registers an already-materialized image as a module, used by tests
    /// and by callers that bring their own images.
    pub fn insert_image(
        &mut self,
        name: impl Into<String>,
        image: Image,
        bias: u64,
        origin: ModuleOrigin,
    ) -> Result<InsertOutcome> {
        let range = image.load_range(4096)?;
        let build_id = image.build_id().map(|(vaddr, bytes)| crate::BuildId {
            vaddr: bias + vaddr,
            bytes,
        });
        let dynamic_vaddr = image.dynamic_segment()?.map(|(vaddr, _)| bias + vaddr);

        self.insert(Module {
            name: name.into(),
            addr_range: bias + range.start..bias + range.end,
            bias,
            build_id,
            dynamic_vaddr,
            is_executable: false,
            origin,
            backing: Backing::Image(Rc::new(image)),
        })
    }
}
