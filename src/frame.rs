//! The call-frame manager.
//!
//! One instance per emitted function. Every named local, parameter and spill
//! slot is registered before the prologue is emitted, so the frame size is
//! final when `SUB sp` happens; nothing is resized mid-function. Slots are
//! addressed frame-pointer-relative at negative offsets, and callee-saved
//! registers are saved at the bottom of the frame, below all slots.
//!
//! Frame shape, high to low addresses:
//!
//! ```text
//!   [x29+8]  saved lr
//!   [x29+0]  saved fp          <- x29
//!   [x29-8]  first local slot
//!   ...      more locals, then spill slots
//!   [sp+8k]  saved callee regs
//!   [sp+0]                     <- sp after SUB
//! ```

use crate::fx::FxHashMap;
use crate::isa::aarch64::imms::Imm12;
use crate::isa::aarch64::inst::{ALUOp, Inst, MemArg};
use crate::isa::aarch64::regs::{fp_reg, is_callee_saved, link_reg, stack_reg, Reg};
use crate::result::{CompileError, CompileResult};
use crate::types::VarType;

use log::trace;

#[derive(Debug)]
pub struct CallFrameManager {
    function: String,
    /// Slot names in registration order; index determines the offset.
    slots: Vec<String>,
    slot_types: FxHashMap<String, VarType>,
    offsets: FxHashMap<String, i32>,
    /// Callee-saved registers this function must preserve.
    must_save: Vec<Reg>,
    frame_size: u32,
    finalized: bool,
}

impl CallFrameManager {
    pub fn new(function: impl Into<String>) -> Self {
        Self {
            function: function.into(),
            slots: Vec::new(),
            slot_types: FxHashMap::default(),
            offsets: FxHashMap::default(),
            must_save: Vec::new(),
            frame_size: 0,
            finalized: false,
        }
    }

    /// Register a named frame slot. Idempotent.
    pub fn add_slot(&mut self, name: &str, ty: VarType) {
        debug_assert!(!self.finalized, "slot added after frame finalization");
        if !self.slot_types.contains_key(name) {
            self.slots.push(name.to_string());
            self.slot_types.insert(name.to_string(), ty);
        }
    }

    /// Register a spill slot for `name`. Same namespace as locals; spilled
    /// variables are just slots whose home is memory.
    pub fn add_spill_slot(&mut self, name: &str, ty: VarType) {
        self.add_slot(name, ty);
    }

    /// Mark a callee-saved register as clobbered by this function.
    pub fn note_callee_saved(&mut self, reg: Reg) {
        debug_assert!(is_callee_saved(reg), "{reg} is not callee-saved");
        if !self.must_save.contains(&reg) {
            self.must_save.push(reg);
        }
    }

    pub fn saved_registers(&self) -> &[Reg] {
        &self.must_save
    }

    /// Assign offsets and compute the final frame size.
    pub fn finalize(&mut self) {
        debug_assert!(!self.finalized);
        for (index, name) in self.slots.iter().enumerate() {
            let offset = -8 * (index as i32 + 1);
            self.offsets.insert(name.clone(), offset);
        }
        self.must_save.sort_by_key(|r| (r.is_float(), r.hw_enc()));
        let bytes = 8 * (self.slots.len() + self.must_save.len()) as u32;
        self.frame_size = (bytes + 15) & !15;
        self.finalized = true;
        trace!(
            "frame for {}: {} slots, {} saved regs, {} bytes",
            self.function,
            self.slots.len(),
            self.must_save.len(),
            self.frame_size
        );
    }

    pub fn frame_size(&self) -> u32 {
        debug_assert!(self.finalized);
        self.frame_size
    }

    /// Frame-pointer-relative offset of a named slot.
    pub fn offset_of(&self, name: &str) -> CompileResult<i32> {
        self.offsets.get(name).copied().ok_or_else(|| {
            CompileError::CodegenInvariant(format!(
                "no frame slot for {name} in {}",
                self.function
            ))
        })
    }

    pub fn has_slot(&self, name: &str) -> bool {
        self.slot_types.contains_key(name)
    }

    /// The `MemArg` addressing a named slot.
    pub fn slot_mem(&self, name: &str) -> CompileResult<MemArg> {
        Ok(MemArg::offset(fp_reg(), self.offset_of(name)?))
    }

    /// Prologue: push fp/lr, establish fp, reserve the frame, save
    /// callee-saved registers.
    pub fn prologue(&self) -> Vec<Inst> {
        debug_assert!(self.finalized);
        let mut insts = vec![
            Inst::StpPre {
                rt: fp_reg(),
                rt2: link_reg(),
                base: stack_reg(),
                offset: -16,
            },
            Inst::MovRR {
                rd: fp_reg(),
                rm: stack_reg(),
                nopeep: true,
            },
        ];
        if self.frame_size > 0 {
            insts.push(Inst::AluRRImm12 {
                op: ALUOp::Sub,
                rd: stack_reg(),
                rn: stack_reg(),
                imm: Imm12::maybe_from_u64(u64::from(self.frame_size))
                    .expect("frame larger than 16 MiB"),
            });
        }
        insts.extend(self.save_restore(true));
        insts
    }

    /// Epilogue: restore callee-saved registers, tear the frame down, return.
    pub fn epilogue(&self) -> Vec<Inst> {
        debug_assert!(self.finalized);
        let mut insts = self.save_restore(false);
        if self.frame_size > 0 {
            insts.push(Inst::AluRRImm12 {
                op: ALUOp::Add,
                rd: stack_reg(),
                rn: stack_reg(),
                imm: Imm12::maybe_from_u64(u64::from(self.frame_size)).unwrap(),
            });
        }
        insts.push(Inst::LdpPost {
            rt: fp_reg(),
            rt2: link_reg(),
            base: stack_reg(),
            offset: 16,
        });
        insts.push(Inst::Ret);
        insts
    }

    /// STP/LDP pairs (plus a trailing STR/LDR for an odd count) covering the
    /// must-save set, at the bottom of the frame.
    fn save_restore(&self, save: bool) -> Vec<Inst> {
        let mut insts = Vec::new();
        let mut offset = 0i32;
        let mut iter = self.must_save.chunks(2);
        for chunk in &mut iter {
            match chunk {
                [a, b] if a.class() == b.class() => {
                    insts.push(if save {
                        Inst::Stp {
                            rt: *a,
                            rt2: *b,
                            base: stack_reg(),
                            offset,
                        }
                    } else {
                        Inst::Ldp {
                            rt: *a,
                            rt2: *b,
                            base: stack_reg(),
                            offset,
                        }
                    });
                    offset += 16;
                }
                regs => {
                    for reg in regs {
                        let mem = MemArg::offset(stack_reg(), offset);
                        insts.push(if save {
                            Inst::Str {
                                rt: *reg,
                                mem,
                                is32: false,
                            }
                        } else {
                            Inst::Ldr {
                                rt: *reg,
                                mem,
                                is32: false,
                            }
                        });
                        offset += 8;
                    }
                }
            }
        }
        insts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isa::aarch64::regs::xreg;

    #[test]
    fn offsets_grow_downward() {
        let mut frame = CallFrameManager::new("f");
        frame.add_slot("a", VarType::INTEGER);
        frame.add_slot("b", VarType::FLOAT);
        frame.add_slot("a", VarType::INTEGER); // idempotent
        frame.finalize();
        assert_eq!(frame.offset_of("a").unwrap(), -8);
        assert_eq!(frame.offset_of("b").unwrap(), -16);
        assert_eq!(frame.frame_size(), 16);
        assert!(frame.offset_of("missing").is_err());
    }

    #[test]
    fn frame_is_16_aligned() {
        let mut frame = CallFrameManager::new("f");
        for name in ["a", "b", "c"] {
            frame.add_slot(name, VarType::INTEGER);
        }
        frame.finalize();
        assert_eq!(frame.frame_size() % 16, 0);
        assert!(frame.frame_size() >= 24);
    }

    #[test]
    fn prologue_saves_callee_regs_and_epilogue_restores() {
        let mut frame = CallFrameManager::new("f");
        frame.add_slot("x", VarType::INTEGER);
        frame.note_callee_saved(xreg(20));
        frame.note_callee_saved(xreg(19));
        frame.finalize();
        let prologue: Vec<String> = frame.prologue().iter().map(|i| i.print()).collect();
        assert_eq!(prologue[0], "stp x29, x30, [sp, #-16]!");
        assert_eq!(prologue[1], "mov x29, sp");
        assert!(prologue[2].starts_with("sub sp, sp"));
        assert!(prologue.iter().any(|t| t == "stp x19, x20, [sp, #0]"));
        let epilogue: Vec<String> = frame.epilogue().iter().map(|i| i.print()).collect();
        assert!(epilogue.iter().any(|t| t == "ldp x19, x20, [sp, #0]"));
        assert_eq!(epilogue.last().unwrap(), "ret");
        assert!(epilogue.iter().any(|t| t == "ldp x29, x30, [sp], #16"));
    }

    #[test]
    fn empty_leaf_frame_has_no_sub() {
        let mut frame = CallFrameManager::new("leaf");
        frame.finalize();
        let prologue = frame.prologue();
        assert_eq!(prologue.len(), 2);
    }
}
