//! JIT compilation of flattened expression programs.
//!
//! Cranelift is the code generator. A set of optimised stack programs (see
//! [`crate::opt`]) is lowered into one native function with the signature
//! `fn(input: *const f64, output: *mut f64)`: every program reads its operands from the
//! input buffer and stores its value into the matching output slot.
//!
//! Transcendental functions are linked in as imported libcalls that forward to the
//! Rust standard library, so the JIT and the interpreter produce the same numbers.

use std::collections::HashMap;
use std::sync::Arc;

use crate::{
    backend::input_width,
    errors::BuilderError,
    expr::{FlattenedExpr, LinearOp},
    types::CompiledFunction,
};
use cranelift::prelude::*;
use cranelift_codegen::ir::FuncRef;
use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::{FuncId, Linkage, Module};
use isa::TargetIsa;

/// Finalised machine code; the JIT module that owns it is never freed.
struct CompiledCode {
    ptr: *const u8,
    n_inputs: usize,
    n_outputs: usize,
}

unsafe impl Send for CompiledCode {}
unsafe impl Sync for CompiledCode {}

impl CompiledCode {
    fn call(&self, input: &[f64], output: &mut [f64]) {
        // the generated code reads and writes without bounds checks
        assert!(
            input.len() >= self.n_inputs && output.len() >= self.n_outputs,
            "compiled function called with {} inputs and {} outputs, needs {} and {}",
            input.len(),
            output.len(),
            self.n_inputs,
            self.n_outputs
        );
        unsafe {
            let f: extern "C" fn(*const f64, *mut f64) = std::mem::transmute(self.ptr);
            f(input.as_ptr(), output.as_mut_ptr());
        }
    }
}

extern "C" fn libcall_exp(x: f64) -> f64 {
    x.exp()
}

extern "C" fn libcall_ln(x: f64) -> f64 {
    x.ln()
}

extern "C" fn libcall_sin(x: f64) -> f64 {
    x.sin()
}

extern "C" fn libcall_cos(x: f64) -> f64 {
    x.cos()
}

extern "C" fn libcall_pow(x: f64, y: f64) -> f64 {
    x.powf(y)
}

const UNARY_LIBCALLS: [(&str, LinearOp); 4] = [
    ("symode_exp", LinearOp::Exp),
    ("symode_ln", LinearOp::Ln),
    ("symode_sin", LinearOp::Sin),
    ("symode_cos", LinearOp::Cos),
];
const POW_LIBCALL: &str = "symode_pow";

/// Creates an Instruction Set Architecture (ISA) target for code generation.
///
/// # Errors
/// Returns a BuilderError if the host machine architecture is not supported or a
/// code generation setting is rejected.
pub(crate) fn create_isa() -> Result<Arc<dyn TargetIsa>, BuilderError> {
    let mut flag_builder = settings::builder();
    let mut set = |name: &str, value: &str| {
        flag_builder
            .set(name, value)
            .map_err(|e| BuilderError::SettingError(format!("{name}={value}: {e}")))
    };

    log::debug!("creating JIT target for {}", target_lexicon::Triple::host());
    // cranelift-jit rejects position-independent code on every host
    set("use_colocated_libcalls", "false")?;
    set("is_pic", "false")?;
    set("opt_level", "speed")?;
    set(
        "enable_verifier",
        if cfg!(debug_assertions) { "true" } else { "false" },
    )?;

    let isa_builder = cranelift_native::builder()
        .map_err(|msg| BuilderError::HostMachineNotSupported(msg.to_string()))?;

    isa_builder
        .finish(settings::Flags::new(flag_builder))
        .map_err(BuilderError::CodegenError)
}

/// Creates a JIT module with the math libcalls registered.
fn create_module(isa: Arc<dyn TargetIsa>) -> JITModule {
    let mut builder = JITBuilder::with_isa(isa, cranelift_module::default_libcall_names());
    builder.symbol("symode_exp", libcall_exp as *const u8);
    builder.symbol("symode_ln", libcall_ln as *const u8);
    builder.symbol("symode_sin", libcall_sin as *const u8);
    builder.symbol("symode_cos", libcall_cos as *const u8);
    builder.symbol(POW_LIBCALL, libcall_pow as *const u8);
    JITModule::new(builder)
}

/// Imported libcalls declared in the module.
struct Libcalls {
    unary: Vec<(LinearOp, FuncId)>,
    pow: FuncId,
}

impl Libcalls {
    fn declare(module: &mut JITModule) -> Result<Self, BuilderError> {
        let mut unary_sig = module.make_signature();
        unary_sig.params.push(AbiParam::new(types::F64));
        unary_sig.returns.push(AbiParam::new(types::F64));
        let mut binary_sig = unary_sig.clone();
        binary_sig.params.push(AbiParam::new(types::F64));

        let declare = |module: &mut JITModule, name: &str, sig: &Signature| {
            module
                .declare_function(name, Linkage::Import, sig)
                .map_err(|e| BuilderError::DeclarationError(format!("{name}: {e}")))
        };

        let mut unary = Vec::with_capacity(UNARY_LIBCALLS.len());
        for (name, op) in UNARY_LIBCALLS {
            unary.push((op, declare(module, name, &unary_sig)?));
        }
        let pow = declare(module, POW_LIBCALL, &binary_sig)?;
        Ok(Self { unary, pow })
    }
}

/// Per-function state while lowering the stack programs.
struct Emitter<'a, 'b> {
    builder: &'a mut FunctionBuilder<'b>,
    input_ptr: Value,
    loads: HashMap<u32, Value>,
    unary: Vec<(LinearOp, FuncRef)>,
    pow: FuncRef,
}

impl Emitter<'_, '_> {
    fn load(&mut self, index: u32) -> Value {
        if let Some(value) = self.loads.get(&index) {
            return *value;
        }
        let value = self.builder.ins().load(
            types::F64,
            MemFlags::trusted(),
            self.input_ptr,
            (index as i32) * 8,
        );
        self.loads.insert(index, value);
        value
    }

    fn call(&mut self, func: FuncRef, args: &[Value]) -> Value {
        let call = self.builder.ins().call(func, args);
        self.builder.inst_results(call)[0]
    }

    fn unary_libcall(&self, op: &LinearOp) -> Result<FuncRef, BuilderError> {
        self.unary
            .iter()
            .find(|(candidate, _)| candidate == op)
            .map(|(_, func)| *func)
            .ok_or_else(|| BuilderError::FunctionError(format!("no libcall for {op:?}")))
    }

    /// Integer powers by repeated squaring; negative exponents take the reciprocal.
    fn powi(&mut self, base: Value, exponent: i64) -> Value {
        let one = self.builder.ins().f64const(1.0);
        if exponent == 0 {
            return one;
        }
        let mut remaining = exponent.unsigned_abs();
        let mut square = base;
        let mut acc: Option<Value> = None;
        while remaining > 0 {
            if remaining & 1 == 1 {
                acc = Some(match acc {
                    Some(a) => self.builder.ins().fmul(a, square),
                    None => square,
                });
            }
            remaining >>= 1;
            if remaining > 0 {
                square = self.builder.ins().fmul(square, square);
            }
        }
        let result = acc.unwrap_or(one);
        if exponent < 0 {
            self.builder.ins().fdiv(one, result)
        } else {
            result
        }
    }

    fn emit(&mut self, program: &FlattenedExpr) -> Result<Value, BuilderError> {
        if let Some(constant) = program.constant_result {
            return Ok(self.builder.ins().f64const(constant));
        }
        let mut stack: Vec<Value> = Vec::with_capacity(program.ops.len());
        let underflow = || BuilderError::FunctionError("stack program underflow".into());

        for op in &program.ops {
            let value = match op {
                LinearOp::LoadConst(c) => self.builder.ins().f64const(*c),
                LinearOp::LoadVar(i) => self.load(*i),
                LinearOp::Add | LinearOp::Sub | LinearOp::Mul | LinearOp::Div | LinearOp::PowExpr => {
                    let r = stack.pop().ok_or_else(underflow)?;
                    let l = stack.pop().ok_or_else(underflow)?;
                    match op {
                        LinearOp::Add => self.builder.ins().fadd(l, r),
                        LinearOp::Sub => self.builder.ins().fsub(l, r),
                        LinearOp::Mul => self.builder.ins().fmul(l, r),
                        LinearOp::Div => self.builder.ins().fdiv(l, r),
                        _ => self.call(self.pow, &[l, r]),
                    }
                }
                LinearOp::Fma | LinearOp::Fmsub => {
                    let c = stack.pop().ok_or_else(underflow)?;
                    let b = stack.pop().ok_or_else(underflow)?;
                    let a = stack.pop().ok_or_else(underflow)?;
                    let c = if matches!(op, LinearOp::Fmsub) {
                        self.builder.ins().fneg(c)
                    } else {
                        c
                    };
                    self.builder.ins().fma(a, b, c)
                }
                unary => {
                    let arg = stack.pop().ok_or_else(underflow)?;
                    match unary {
                        LinearOp::Abs => self.builder.ins().fabs(arg),
                        LinearOp::Neg => self.builder.ins().fneg(arg),
                        LinearOp::Sqrt => self.builder.ins().sqrt(arg),
                        LinearOp::PowConst(n) => self.powi(arg, *n),
                        LinearOp::PowFloat(c) => {
                            let exponent = self.builder.ins().f64const(*c);
                            self.call(self.pow, &[arg, exponent])
                        }
                        other => {
                            let func = self.unary_libcall(other)?;
                            self.call(func, &[arg])
                        }
                    }
                }
            };
            stack.push(value);
        }

        match stack.as_slice() {
            [value] => Ok(*value),
            _ => Err(BuilderError::FunctionError(format!(
                "stack program left {} values",
                stack.len()
            ))),
        }
    }
}

/// Compiles several programs into one native function writing one output per program.
///
/// # Errors
/// Returns a BuilderError if the ISA cannot be created or Cranelift rejects the
/// generated function.
///
/// # Panics
/// The returned function panics when the input buffer is narrower than the highest
/// slot the programs read, or the output buffer is shorter than the number of programs.
pub fn build_combined_function(
    programs: &[FlattenedExpr],
) -> Result<CompiledFunction, BuilderError> {
    let isa = create_isa()?;
    let pointer_type = isa.pointer_type();
    let mut module = create_module(isa);
    let libcalls = Libcalls::declare(&mut module)?;

    // fn(input_ptr: *const f64, output_ptr: *mut f64)
    let mut sig = module.make_signature();
    sig.params.push(AbiParam::new(pointer_type));
    sig.params.push(AbiParam::new(pointer_type));

    let func_id = module
        .declare_function("combined", Linkage::Export, &sig)
        .map_err(|e| BuilderError::DeclarationError(e.to_string()))?;

    let mut ctx = module.make_context();
    ctx.func.signature = sig;
    let mut builder_context = FunctionBuilderContext::new();
    {
        let mut builder = FunctionBuilder::new(&mut ctx.func, &mut builder_context);
        let entry_block = builder.create_block();
        builder.append_block_params_for_function_params(entry_block);
        builder.switch_to_block(entry_block);
        builder.seal_block(entry_block);

        let input_ptr = builder.block_params(entry_block)[0];
        let output_ptr = builder.block_params(entry_block)[1];

        let unary = libcalls
            .unary
            .iter()
            .map(|(op, id)| (op.clone(), module.declare_func_in_func(*id, builder.func)))
            .collect();
        let pow = module.declare_func_in_func(libcalls.pow, builder.func);

        let mut emitter = Emitter {
            builder: &mut builder,
            input_ptr,
            loads: HashMap::new(),
            unary,
            pow,
        };
        for (i, program) in programs.iter().enumerate() {
            let value = emitter.emit(program)?;
            emitter
                .builder
                .ins()
                .store(MemFlags::trusted(), value, output_ptr, (i as i32) * 8);
        }

        builder.ins().return_(&[]);
        builder.finalize();
    }

    module
        .define_function(func_id, &mut ctx)
        .map_err(|e| BuilderError::FunctionError(e.to_string()))?;
    module.clear_context(&mut ctx);
    module.finalize_definitions()?;

    let code = CompiledCode {
        ptr: module.get_finalized_function(func_id),
        n_inputs: input_width(programs),
        n_outputs: programs.len(),
    };
    Ok(Arc::new(move |input: &[f64], output: &mut [f64]| {
        code.call(input, output)
    }))
}
