use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::{debug, error, trace, warn};

use crate::cpu::{Context, Reg, SegReg};
use crate::error::{LoadError, Result};
use crate::machine::{Machine, Thread};
use crate::ne::{ModuleFlags, NeModule, find_entry_mut};
use crate::selector::SegPtr;

const FIRST_MODULE_HANDLE: u16 = 0x0100;
const MODULE_HANDLE_STEP: u16 = 0x10;

/// Selector reported for constant entries.
pub const CONSTANT_SELECTOR: u16 = 0xffff;

/// Every NE module known to the process, by handle.
#[derive(Debug)]
pub struct ModuleRegistry {
    modules: BTreeMap<u16, NeModule>,
    next_handle: u16,
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        Self {
            modules: BTreeMap::new(),
            next_handle: FIRST_MODULE_HANDLE,
        }
    }
}

impl ModuleRegistry {
    pub fn register(&mut self, mut module: NeModule) -> u16 {
        let handle = self.next_handle;
        self.next_handle = self.next_handle.wrapping_add(MODULE_HANDLE_STEP);
        module.handle = handle;
        self.modules.insert(handle, module);
        handle
    }

    pub fn get(&self, handle: u16) -> Option<&NeModule> {
        self.modules.get(&handle)
    }

    pub fn get_mut(&mut self, handle: u16) -> Option<&mut NeModule> {
        self.modules.get_mut(&handle)
    }

    pub fn remove(&mut self, handle: u16) -> Option<NeModule> {
        self.modules.remove(&handle)
    }

    pub fn handles(&self) -> impl Iterator<Item = u16> + '_ {
        self.modules.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Look a module up the way `GetModuleHandle` does: a bare name matches
    /// the module name, a name with an extension matches the file name.
    pub fn find_by_name(&self, name: &str) -> Option<u16> {
        let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
        let has_extension = base.contains('.');

        self.modules.iter().find_map(|(&handle, module)| {
            let matches = if has_extension {
                module
                    .path
                    .file_name()
                    .and_then(|f| f.to_str())
                    .is_some_and(|f| f.eq_ignore_ascii_case(base))
            } else {
                module.name().eq_ignore_ascii_case(base)
            };
            matches.then_some(handle)
        })
    }
}

/// Append `.DLL` (Windows 3.0 and later) or `.EXE` to a name with no extension.
pub fn with_default_extension(name: &str, windows_version: u16) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    if base.contains('.') {
        name.to_string()
    } else if windows_version >= 0x0300 {
        format!("{name}.DLL")
    } else {
        format!("{name}.EXE")
    }
}

impl Machine {
    /// Resolve an exported name (or `#ordinal`) to its ordinal, 0 if unknown.
    pub fn get_ordinal(&self, handle: u16, name: &str) -> u16 {
        let Some(module) = self.modules.get(handle) else {
            return 0;
        };
        trace!(target: "module", "get_ordinal({handle:#06x}, '{name}')");

        if let Some(number) = name.strip_prefix('#') {
            let digits: String = number.chars().take_while(char::is_ascii_digit).collect();
            return digits.parse().unwrap_or(0);
        }

        let wanted = name.to_ascii_uppercase();
        module
            .resident_names
            .iter()
            .skip(1)
            .chain(module.nonresident_names.iter().skip(1))
            .find(|entry| entry.name == wanted.as_bytes())
            .map_or(0, |entry| entry.ordinal)
    }

    pub fn get_entry_point(&self, handle: u16, ordinal: u16) -> Option<SegPtr> {
        let module = self.modules.get(handle)?;
        let entry = module.entry(ordinal)?;
        if entry.is_constant() {
            return Some(SegPtr::new(CONSTANT_SELECTOR, entry.offset));
        }
        let selector = module.segment(u16::from(entry.segment))?.selector;
        if selector == 0 {
            return None;
        }
        Some(SegPtr::new(selector, entry.offset))
    }

    /// The `EntryAddrProc` service offered to self-loading modules.
    pub fn entry_addr_proc(&self, handle: u16, ordinal: u16) -> SegPtr {
        self.get_entry_point(handle, ordinal).unwrap_or_default()
    }

    /// Change the offset of an existing entry point.
    pub fn set_entry_point(&mut self, handle: u16, ordinal: u16, offset: u16) -> bool {
        self.modules
            .get_mut(handle)
            .and_then(|module| find_entry_mut(&mut module.entries, ordinal))
            .map(|entry| entry.offset = offset)
            .is_some()
    }

    /// Load an NE module with its DLLs and all of its segments.
    pub fn load_module(&mut self, thread: &mut Thread, path: &Path) -> Result<u16> {
        let module = NeModule::open(path)?;
        let handle = self.modules.register(module);

        match self.do_load_module(thread, handle) {
            Ok(()) => Ok(handle),
            Err(err) => {
                self.free_module(handle);
                Err(err)
            }
        }
    }

    fn do_load_module(&mut self, thread: &mut Thread, handle: u16) -> Result<()> {
        self.create_all_segments(handle)?;
        self.load_dlls(thread, handle)?;
        self.load_all_segments(thread, handle)?;
        self.fixup_prologs(handle);

        // Circular references may have bumped the count while loading.
        if let Some(module) = self.modules.get_mut(handle) {
            module.usage = 1;
        }
        Ok(())
    }

    /// Unregister a module and release every selector it owns.
    pub fn free_module(&mut self, handle: u16) -> Option<NeModule> {
        let module = self.modules.remove(handle)?;
        for selector in self.ldt.owned_by(handle) {
            self.global_free(selector);
        }
        debug!(target: "module", "freed {} ({handle:#06x})", module.name());
        Some(module)
    }

    /// Load every module referenced by `handle` and build its module table.
    pub fn load_dlls(&mut self, thread: &mut Thread, handle: u16) -> Result<()> {
        let (names, dir, importer) = {
            let module = self
                .modules
                .get(handle)
                .ok_or(LoadError::NoSuchModule(handle))?;
            let names: Vec<String> = module
                .module_refs
                .iter()
                .map(|&offset| {
                    module
                        .imported_name(offset)
                        .map(|n| String::from_utf8_lossy(n).into_owned())
                        .unwrap_or_default()
                })
                .collect();
            (names, module.path.parent().map(Path::to_path_buf), module.name())
        };

        let mut table = Vec::with_capacity(names.len());
        let mut to_init = Vec::new();

        for name in names {
            trace!(target: "module", "{importer} imports '{name}'");

            if let Some(existing) = self.modules.find_by_name(&name) {
                if let Some(dll) = self.modules.get_mut(existing) {
                    dll.usage += 1;
                }
                table.push(existing);
                continue;
            }

            let file_name = with_default_extension(&name, self.config.loader.windows_version);
            let loaded = self
                .find_module_file(&file_name, dir.as_deref())
                .ok_or_else(|| {
                    LoadError::from(io::Error::new(
                        io::ErrorKind::NotFound,
                        format!("{file_name} not found"),
                    ))
                })
                .and_then(|path| self.load_module(thread, &path));

            match loaded {
                Ok(dll) => {
                    table.push(dll);
                    to_init.push(dll);
                }
                Err(err) => {
                    error!(target: "module", "could not load '{file_name}' required by '{importer}': {err}");
                    return Err(LoadError::MissingDependency {
                        name: file_name,
                        required_by: importer,
                        source: Box::new(err),
                    });
                }
            }
        }

        let module = self
            .modules
            .get_mut(handle)
            .ok_or(LoadError::NoSuchModule(handle))?;
        module.module_table = table;
        module.dlls_to_init = to_init;
        Ok(())
    }

    /// Search the importing module's directory, then the configured search
    /// path, matching file names case-insensitively.
    fn find_module_file(&self, name: &str, importer_dir: Option<&Path>) -> Option<PathBuf> {
        let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
        let dirs = importer_dir
            .into_iter()
            .map(Path::to_path_buf)
            .chain(self.config.loader.search_path.iter().cloned());

        for dir in dirs {
            let exact = dir.join(base);
            if exact.is_file() {
                return Some(exact);
            }
            let Ok(listing) = fs::read_dir(&dir) else {
                continue;
            };
            let found = listing.flatten().find(|entry| {
                entry
                    .file_name()
                    .to_str()
                    .is_some_and(|f| f.eq_ignore_ascii_case(base))
            });
            if let Some(entry) = found {
                return Some(entry.path());
            }
        }
        None
    }

    /// Call the initialization routine of every DLL loaded on behalf of
    /// `handle`, dependencies first, then that of `handle` itself.
    pub fn initialize_dlls(&mut self, thread: &mut Thread, handle: u16) -> Result<()> {
        let to_init = match self.modules.get_mut(handle) {
            Some(module) => std::mem::take(&mut module.dlls_to_init),
            None => return Err(LoadError::NoSuchModule(handle)),
        };
        for dll in to_init {
            self.initialize_dlls(thread, dll)?;
        }
        self.init_dll(thread, handle)
    }

    fn init_dll(&mut self, thread: &mut Thread, handle: u16) -> Result<()> {
        let module = self
            .modules
            .get(handle)
            .ok_or(LoadError::NoSuchModule(handle))?;
        if !module.flags().contains(ModuleFlags::LIBMODULE) {
            return Ok(());
        }
        let (cs_seg, ip) = module.header.cs_ip;
        if cs_seg == 0 {
            return Ok(());
        }
        let cs = module
            .segment(cs_seg)
            .ok_or(LoadError::NoSuchSegment {
                module: handle,
                segment: cs_seg,
            })?
            .selector;
        let ds = module.dgroup_selector();
        let instance = if ds != 0 { ds } else { handle };
        let heap = module.header.heap_size;
        let name = module.name();

        let mut ctx = Context::default();
        ctx.set_sreg(SegReg::Cs, cs);
        ctx.set_sreg(SegReg::Ds, ds);
        ctx.set_sreg(SegReg::Es, ds);
        ctx.eip = u32::from(ip);
        ctx.set_reg(Reg::Ecx, u32::from(heap));
        ctx.set_reg(Reg::Edi, u32::from(instance));

        debug!(target: "module", "calling LibMain of {name} at {cs:04x}:{ip:04x} ds={ds:04x} di={instance:04x} cx={heap:04x}");
        self.with_callbacks(|callbacks, machine| callbacks.call16_regs(machine, thread, &mut ctx))
            .map_err(LoadError::Callout)?;

        if ctx.reg16(Reg::Eax) == 0 {
            warn!(target: "module", "initialization of {name} returned 0");
        }
        Ok(())
    }

    /// Find the GP fault handler the module owning `cs` registered for `ip`.
    ///
    /// The handler table is exported as `__GP`: 8-byte records of selector,
    /// range start, range end (exclusive) and handler offset, ending at a
    /// record with selector 0.
    pub fn has_gp_handler(&self, cs: u16, ip: u16) -> Option<SegPtr> {
        let owner = self.far_get_owner(cs);
        if owner == 0 {
            return None;
        }
        let ordinal = self.get_ordinal(owner, "__GP");
        if ordinal == 0 {
            return None;
        }
        let table = self.get_entry_point(owner, ordinal)?;

        let mut offset = u32::from(table.offset());
        loop {
            let record = self.read_bytes16(table.selector(), offset, 8).ok()?;
            let word = |i: usize| u16::from_le_bytes([record[i], record[i + 1]]);
            let (selector, start, end, handler) = (word(0), word(2), word(4), word(6));
            if selector == 0 {
                return None;
            }
            if selector == cs && ip >= start && ip < end {
                return Some(SegPtr::new(selector, handler));
            }
            offset += 8;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_extension_depends_on_version() {
        assert_eq!(with_default_extension("GDI", 0x030a), "GDI.DLL");
        assert_eq!(with_default_extension("GDI", 0x0201), "GDI.EXE");
        assert_eq!(with_default_extension("SOUND.DRV", 0x030a), "SOUND.DRV");
        assert_eq!(with_default_extension("C:\\WIN.DIR\\GDI", 0x030a), "C:\\WIN.DIR\\GDI.DLL");
    }
}
