//! Call lowering.
//!
//! Local calls are a plain `bl` to the function's label; runtime and other
//! external calls branch through their veneer. Virtual method calls load the
//! vtable pointer from word 0 of the object, the method address from the
//! method's slot, and `blr`; a `SUPER` call is the same dispatch with the
//! slot taken from the parent class's method table, so an override keeps
//! working through the shared slot index. `NEW` allocates, installs the
//! vtable pointer, and runs the constructor through slot 0.
//!
//! Arguments are placed per the ARM64 PCS: integer and pointer values in
//! x0..x7, floats in d0..d7, the object pointer always first. Arguments that
//! themselves perform calls are evaluated before any argument register is
//! written, parking their values in callee-saved temporaries.

use crate::analysis::intervals::expr_calls;
use crate::ast::Expr;
use crate::data::vtable_label;
use crate::isa::aarch64::inst::{Inst, MemArg};
use crate::isa::aarch64::regs::{dreg, xreg, Reg, RegClass};
use crate::regalloc::AllocationMap;
use crate::result::{CompileError, CompileResult};
use crate::types::VarType;

use super::CodeGenerator;

impl CodeGenerator<'_> {
    /// Lower a call in statement or expression position. Returns the result
    /// register for value-producing calls.
    pub(crate) fn lower_call(
        &mut self,
        func: &Expr,
        args: &[Expr],
        allocation: &AllocationMap,
    ) -> CompileResult<Option<Reg>> {
        match func {
            Expr::Variable(name) => {
                let name = name.clone();
                self.lower_direct_call(&name, args, allocation).map(Some)
            }
            Expr::MemberAccess { object, member } => {
                let object = (**object).clone();
                let member = member.clone();
                self.lower_virtual_call(&object, &member, args, allocation)
                    .map(Some)
            }
            Expr::SuperMethodCall {
                member,
                args: super_args,
            } => {
                // Statement-position SUPER calls arrive with their own
                // argument list on the inner node.
                let member = member.clone();
                let super_args = super_args.clone();
                let effective: &[Expr] = if super_args.is_empty() {
                    args
                } else {
                    &super_args
                };
                self.lower_super_call(&member, effective, allocation).map(Some)
            }
            other => {
                // Indirect call through a computed address.
                let addr = self.emit_expr(other, allocation)?;
                let target = self.scratch.acquire_callee_temp().or_else(|_| {
                    self.scratch.acquire_int()
                })?;
                self.move_into(target, addr);
                self.scratch.release(addr);
                self.emit_arguments(args, 0, allocation)?;
                self.emit(Inst::Blr { rn: target });
                self.scratch.release(target);
                self.scratch.invalidate_caller_saved();
                let dest = self.scratch.acquire_int()?;
                self.emit(Inst::mov(dest, xreg(0)));
                Ok(Some(dest))
            }
        }
    }

    fn lower_direct_call(
        &mut self,
        name: &str,
        args: &[Expr],
        allocation: &AllocationMap,
    ) -> CompileResult<Reg> {
        self.emit_arguments(args, 0, allocation)?;
        self.emit_call_to(name);
        self.scratch.invalidate_caller_saved();

        let return_type = match name {
            "BCPL_LIST_GET_HEAD_AS_FLOAT" => VarType::FLOAT,
            _ => self
                .analyzer
                .metrics_for(name)
                .map(|m| m.return_type)
                .unwrap_or(VarType::INTEGER),
        };
        self.capture_result(return_type)
    }

    fn lower_virtual_call(
        &mut self,
        object: &Expr,
        member: &str,
        args: &[Expr],
        allocation: &AllocationMap,
    ) -> CompileResult<Reg> {
        let class = self.expr_class(object).ok_or_else(|| {
            CompileError::CodegenInvariant(format!(
                "cannot determine the receiver class for method call .{member}"
            ))
        })?;
        let (slot, return_type) = {
            let method = self.classes.find_method(&class, member).ok_or_else(|| {
                CompileError::CodegenInvariant(format!("class {class} has no method {member}"))
            })?;
            (method.vtable_slot, method.return_type)
        };

        // Evaluate the receiver before any argument register is written.
        let obj = self.emit_expr(object, allocation)?;
        let receiver = self
            .scratch
            .acquire_callee_temp()
            .or_else(|_| self.scratch.acquire_int())?;
        self.move_into(receiver, obj);
        self.scratch.release(obj);

        self.emit_arguments(args, 1, allocation)?;
        if receiver != xreg(0) {
            self.emit(Inst::mov(xreg(0), receiver));
        }
        self.scratch.release(receiver);

        self.emit_vtable_dispatch(slot)?;
        self.capture_result(return_type)
    }

    pub(crate) fn lower_super_call(
        &mut self,
        member: &str,
        args: &[Expr],
        allocation: &AllocationMap,
    ) -> CompileResult<Reg> {
        let current_class = self.current_class.clone().ok_or_else(|| {
            CompileError::CodegenInvariant("SUPER call outside a method".to_string())
        })?;
        let parent = self
            .classes
            .get_class(&current_class)
            .map(|e| e.parent_name.clone())
            .filter(|p| !p.is_empty())
            .ok_or_else(|| {
                CompileError::CodegenInvariant(format!(
                    "SUPER call in {current_class}, which has no parent"
                ))
            })?;
        // The slot index comes from the parent's view of the method.
        let (slot, return_type) = {
            let method = self.classes.find_method(&parent, member).ok_or_else(|| {
                CompileError::CodegenInvariant(format!(
                    "parent class {parent} has no method {member}"
                ))
            })?;
            (method.vtable_slot, method.return_type)
        };

        self.emit_arguments(args, 1, allocation)?;
        let this = self.load_variable("_this", allocation)?;
        if this != xreg(0) {
            self.emit(Inst::mov(xreg(0), this));
        }
        self.scratch.release(this);

        self.emit_vtable_dispatch(slot)?;
        self.capture_result(return_type)
    }

    /// `NEW C(args...)`: allocate, install the vtable pointer, run CREATE
    /// through slot 0, and yield the object pointer.
    pub(crate) fn lower_new(
        &mut self,
        class_name: &str,
        args: &[Expr],
        allocation: &AllocationMap,
    ) -> CompileResult<Reg> {
        let instance_size = self
            .classes
            .get_class(class_name)
            .filter(|e| e.is_layout_finalized)
            .map(|e| e.instance_size)
            .ok_or_else(|| {
                CompileError::CodegenInvariant(format!("unknown class {class_name} in NEW"))
            })?;

        let insts = Inst::load_constant(xreg(0), instance_size);
        self.emit_all(&insts);
        self.emit_call_to("OBJECT_HEAP_ALLOC");
        self.scratch.invalidate_caller_saved();

        // Word 0 holds the vtable pointer.
        let vt = self.scratch.acquire_int()?;
        self.load_label_address(&vtable_label(class_name), vt);
        self.emit(Inst::Str {
            rt: vt,
            mem: MemArg::base_only(xreg(0)),
            is32: false,
        });
        self.scratch.release(vt);

        // Keep the object across the constructor call.
        let obj = self
            .scratch
            .acquire_callee_temp()
            .or_else(|_| self.scratch.acquire_int())?;
        self.emit(Inst::mov(obj, xreg(0)));

        self.emit_arguments(args, 1, allocation)?;
        if obj != xreg(0) {
            self.emit(Inst::MovRR {
                rd: xreg(0),
                rm: obj,
                nopeep: true,
            });
        }
        self.emit_vtable_dispatch(0)?;

        let dest = self.scratch.acquire_int()?;
        self.emit(Inst::mov(dest, obj));
        self.scratch.release(obj);
        Ok(dest)
    }

    /// Load the vtable pointer from `[x0]`, the method address from its
    /// slot, and branch-with-link through it.
    fn emit_vtable_dispatch(&mut self, slot: usize) -> CompileResult<()> {
        let addr = self.scratch.acquire_int()?;
        self.emit(Inst::Ldr {
            rt: addr,
            mem: MemArg::base_only(xreg(0)),
            is32: false,
        });
        self.emit(Inst::Ldr {
            rt: addr,
            mem: MemArg::offset(addr, (slot * 8) as i32),
            is32: false,
        });
        self.emit(Inst::Blr { rn: addr });
        self.scratch.release(addr);
        self.scratch.invalidate_caller_saved();
        Ok(())
    }

    /// Copy the ABI result register into fresh scratch so later expression
    /// code cannot clobber it.
    fn capture_result(&mut self, return_type: VarType) -> CompileResult<Reg> {
        if return_type.uses_fp_register() {
            let dest = self.scratch.acquire_float()?;
            self.emit(Inst::FMovFF {
                rd: dest,
                rn: dreg(0),
            });
            Ok(dest)
        } else {
            let dest = self.scratch.acquire_int()?;
            self.emit(Inst::mov(dest, xreg(0)));
            Ok(dest)
        }
    }

    /// Evaluate and place the arguments. `first_int_slot` is 1 for method
    /// calls, where x0 carries the object pointer.
    pub(crate) fn emit_arguments(
        &mut self,
        args: &[Expr],
        first_int_slot: u8,
        allocation: &AllocationMap,
    ) -> CompileResult<()> {
        // Phase 1: call-bearing arguments first, parked in temporaries that
        // survive the nested calls.
        let mut parked: Vec<(usize, Reg)> = Vec::new();
        for (i, arg) in args.iter().enumerate() {
            if expr_calls(arg) {
                let value = self.emit_expr(arg, allocation)?;
                let temp = self
                    .scratch
                    .acquire_callee_temp()
                    .or_else(|_| match value.class() {
                        RegClass::Int => self.scratch.acquire_int(),
                        RegClass::Float => self.scratch.acquire_float(),
                    })?;
                self.move_into(temp, value);
                self.scratch.release(value);
                parked.push((i, temp));
            }
        }

        // Phase 2: place everything into the argument registers in order.
        let mut int_slot = first_int_slot;
        let mut float_slot = 0u8;
        for (i, arg) in args.iter().enumerate() {
            let is_float = self.expr_ty(arg, allocation).uses_fp_register();
            let target = if is_float {
                let r = dreg(float_slot);
                float_slot += 1;
                r
            } else {
                let r = xreg(int_slot);
                int_slot += 1;
                r
            };
            if target.hw_enc() >= 8 {
                return Err(CompileError::CodegenInvariant(
                    "more than eight register arguments".to_string(),
                ));
            }
            match parked.iter().find(|(index, _)| *index == i) {
                Some(&(_, temp)) => {
                    self.move_into(target, temp);
                    self.scratch.release(temp);
                }
                None => {
                    let value = self.emit_expr(arg, allocation)?;
                    self.move_into(target, value);
                    self.scratch.release(value);
                }
            }
        }
        Ok(())
    }
}
