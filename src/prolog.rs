use log::{debug, trace, warn};

use crate::machine::Machine;
use crate::ne::{EntryFlags, ModuleFlags};

const NOP: u8 = 0x90;
const MOV_AX_IMM16: u8 = 0xb8;
/// `push ds; pop ax` and `mov ax, ds`, each padded to three bytes with a nop.
const PROLOGS: [[u8; 2]; 2] = [[0x1e, 0x58], [0x8c, 0xd8]];

fn is_known_prolog(code: &[u8]) -> bool {
    code.len() == 3 && code[2] == NOP && PROLOGS.iter().any(|p| code[..2] == p[..])
}

impl Machine {
    /// Patch the data-segment prolog of every exported function of `handle`.
    pub fn fixup_prologs(&mut self, handle: u16) {
        let Some(module) = self.modules.get(handle) else {
            return;
        };
        let flags = module.flags();
        let dgroup = module.dgroup_selector();
        let name = module.name();

        let exports: Vec<(u16, u16, u16, bool)> = module
            .entries
            .iter()
            .flat_map(|bundle| bundle.ordinals())
            .filter(|(_, entry)| entry.flags.contains(EntryFlags::EXPORTED) && !entry.is_constant())
            .filter_map(|(ordinal, entry)| {
                let sel = module.segment(u16::from(entry.segment))?.selector;
                let shared = entry.flags.contains(EntryFlags::SHARED_DATA);
                (sel != 0).then_some((ordinal, sel, entry.offset, shared))
            })
            .collect();

        for (ordinal, sel, offset, shared) in exports {
            let code = match self.read_bytes16(sel, u32::from(offset), 3) {
                Ok(code) => code,
                Err(err) => {
                    debug!(target: "prolog", "{name}.{ordinal}: cannot read prolog: {err}");
                    continue;
                }
            };
            if !is_known_prolog(code) {
                debug!(target: "prolog", "{name}.{ordinal} at {sel:04x}:{offset:04x}: unrecognised prolog {code:02x?}");
                continue;
            }

            let patch = if shared {
                if flags.contains(ModuleFlags::MULTIPLEDATA) {
                    warn!(target: "prolog", "{name}.{ordinal}: shared-data entry in a multiple-data module left alone");
                    None
                } else if flags.contains(ModuleFlags::SINGLEDATA) && dgroup != 0 {
                    let [lo, hi] = dgroup.to_le_bytes();
                    Some([MOV_AX_IMM16, lo, hi])
                } else {
                    None
                }
            } else if flags.contains(ModuleFlags::MULTIPLEDATA) {
                Some([NOP; 3])
            } else {
                None
            };

            if let Some(bytes) = patch {
                trace!(target: "prolog", "{name}.{ordinal} at {sel:04x}:{offset:04x} -> {bytes:02x?}");
                if let Err(err) = self.write_bytes16(sel, u32::from(offset), &bytes) {
                    debug!(target: "prolog", "{name}.{ordinal}: cannot patch prolog: {err}");
                }
            }
        }
    }
}
