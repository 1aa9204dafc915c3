use std::panic::{self, AssertUnwindSafe};

use derive_where::derive_where;
use tracing::{debug, warn};

use crate::{
    ArgKind, CallMemory, FunctionSpec, LayoutPlan, MarshalError, NativeArg, NativeFault, NativeFn,
    NativeRoutine, NativeValue, Number, ReturnType, ScratchArena, SpecError, Value, Width,
    utils::{truncate_to_width, usize_to_u32},
};

/// The runtime marshaler of one native routine.
///
/// Built once per routine from its descriptors. Every call goes through a single scratch region
/// that is released before [`call`](Self::call) returns, whatever the outcome.
#[derive_where(Debug)]
pub struct Wrapper {
    name: String,
    spec: FunctionSpec,
    plan: LayoutPlan,
    #[derive_where(skip)]
    func: NativeFn,
}

impl Wrapper {
    pub fn new(routine: NativeRoutine) -> Result<Self, SpecError> {
        let spec = FunctionSpec::parse(&routine.name, &routine.args, &routine.ret)?;

        Ok(Self::with_spec(routine.name, spec, routine.func))
    }

    /// Builds a wrapper from an already parsed spec.
    pub fn with_spec(name: String, spec: FunctionSpec, func: NativeFn) -> Self {
        let plan = LayoutPlan::new(&spec.args);

        Self {
            name,
            spec,
            plan,
            func,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn spec(&self) -> &FunctionSpec {
        &self.spec
    }

    pub fn plan(&self) -> &LayoutPlan {
        &self.plan
    }

    /// Invokes the routine with positional arguments. Buffers and cells in `args` receive the
    /// routine's outputs in place when it succeeds.
    pub fn call(
        &mut self,
        arena: &mut ScratchArena,
        args: &mut [Value],
    ) -> Result<Value, MarshalError> {
        let Self {
            name,
            spec,
            plan,
            func,
        } = self;

        let scratch = |reason: anyhow::Error| MarshalError::Scratch {
            function: name.clone(),
            reason,
        };

        // Check the arguments before touching the arena.
        if args.len() < spec.args.len() {
            return Err(MarshalError::Arity {
                function: name.clone(),
                expected: spec.args.len(),
                got: args.len(),
            });
        }

        for (index, (arg, value)) in spec.args.iter().zip(args.iter()).enumerate() {
            let shape = value.shape();

            if !arg.kind.accepts(shape) {
                return Err(MarshalError::TypeMismatch {
                    function: name.clone(),
                    index,
                    name: arg.name.clone(),
                    expected: arg.kind.expectation(),
                    found: shape.to_string(),
                });
            }
        }

        // Lay out the region.
        let byte_lens = plan
            .var_slots()
            .iter()
            .map(|slot| usize_to_u32(buffer_of(&args[slot.arg]).len()))
            .collect::<anyhow::Result<Vec<_>>>()
            .map_err(scratch)?;

        let placement = plan.place(&byte_lens).map_err(scratch)?;

        let mut var_addrs = vec![None; spec.args.len()];
        for (slot, &offset) in plan.var_slots().iter().zip(&placement.offsets) {
            var_addrs[slot.arg] = Some(CallMemory::addr_of(offset));
        }

        let handle = arena.alloc(placement.total).map_err(scratch)?;

        let mut arena = scopeguard::guard(arena, |arena| {
            if let Err(err) = arena.release(handle) {
                warn!("failed to release scratch region: {err:#}");
            }
        });

        let outcome = {
            let mut memory = arena.memory(handle).map_err(scratch)?;

            // Seed the region.
            for slot in plan.fixed_slots() {
                let seed = match &args[slot.arg] {
                    Value::Number(n) | Value::Cell(Some(n)) => Some(*n),
                    _ => None,
                };

                write_scalar(&mut memory, CallMemory::addr_of(slot.offset), slot.width, seed)
                    .map_err(scratch)?;
            }

            for slot in plan.var_slots() {
                let bytes = buffer_of(&args[slot.arg]);
                let addr = var_addrs[slot.arg].unwrap_or_default();

                memory
                    .bytes_mut(addr, byte_len(bytes))
                    .map_err(scratch)?
                    .copy_from_slice(bytes);
            }

            // Invoke the routine.
            let native_args = spec
                .args
                .iter()
                .enumerate()
                .map(|(index, arg)| match arg.kind {
                    ArgKind::FixedIn(width) => native_scalar(width, &args[index]),
                    ArgKind::Context => native_scalar(Width::Ptr, &args[index]),
                    ArgKind::FixedOut(_) => NativeArg::Ptr(
                        plan.fixed_slot(index)
                            .map_or(0, |slot| CallMemory::addr_of(slot.offset)),
                    ),
                    ArgKind::VarIn(_) | ArgKind::VarOut(_) => {
                        NativeArg::Ptr(var_addrs[index].unwrap_or_default())
                    }
                    ArgKind::StrIn => match &args[index] {
                        Value::Str(s) => NativeArg::Str(s),
                        _ => NativeArg::Ptr(0),
                    },
                })
                .collect::<Vec<_>>();

            debug!(function = %name, size = placement.total, "invoking native routine");

            let outcome = match panic::catch_unwind(AssertUnwindSafe(|| {
                (*func)(&mut memory, &native_args)
            })) {
                Ok(res) => res,
                Err(payload) => Err(NativeFault::new(panic_message(payload.as_ref()))),
            };

            drop(native_args);

            // Read the outputs back.
            if outcome.is_ok() {
                for slot in plan.var_slots() {
                    if !matches!(spec.args[slot.arg].kind, ArgKind::VarOut(_)) {
                        continue;
                    }

                    let addr = var_addrs[slot.arg].unwrap_or_default();

                    if let Value::Buffer(buffer) = &mut args[slot.arg] {
                        let dst = buffer.as_bytes_mut();
                        let src = memory.bytes(addr, byte_len(dst)).map_err(scratch)?;
                        dst.copy_from_slice(src);
                    }
                }

                for slot in plan.fixed_slots() {
                    if let Value::Cell(cell) = &mut args[slot.arg] {
                        *cell = Some(
                            read_scalar(&memory, CallMemory::addr_of(slot.offset), slot.width)
                                .map_err(scratch)?,
                        );
                    }
                }
            }

            outcome
        };

        // Release before reporting anything.
        drop(arena);

        let ret = match outcome {
            Ok(ret) => ret,
            Err(fault) => {
                warn!(function = %name, "native routine failed: {fault}");

                return Err(MarshalError::Native {
                    function: name.clone(),
                    fault,
                });
            }
        };

        let value = match (spec.ret, ret) {
            (ReturnType::Void, NativeValue::Void) => Value::Null,
            (ReturnType::Str, NativeValue::Str(s)) => Value::Str(s),
            (ReturnType::Scalar(w), NativeValue::Float(v)) if w.is_float() => Value::float(v),
            (ReturnType::Scalar(w), NativeValue::Int(v)) if !w.is_float() => Value::int(v),
            (ReturnType::Scalar(w), NativeValue::Ptr(v)) if !w.is_float() => {
                Value::int(v.into())
            }
            (expected, found) => {
                return Err(MarshalError::ReturnTypeMismatch {
                    function: name.clone(),
                    expected: expected.to_string(),
                    found: found.kind_name().to_string(),
                });
            }
        };

        Ok(value)
    }
}

// === Helpers === //

fn buffer_of(value: &Value) -> &[u8] {
    match value {
        Value::Buffer(buffer) => buffer.as_bytes(),
        _ => &[],
    }
}

fn byte_len(bytes: &[u8]) -> u32 {
    // Lengths were checked against the address space when the region was placed.
    bytes.len() as u32
}

fn native_scalar(width: Width, value: &Value) -> NativeArg<'static> {
    let Some(n) = value.as_number() else {
        return NativeArg::Ptr(0);
    };

    match width {
        Width::Ptr => NativeArg::Ptr(n.as_i64() as u32),
        Width::F32 => NativeArg::Float(n.as_f64() as f32 as f64),
        Width::F64 => NativeArg::Float(n.as_f64()),
        width => NativeArg::Int(truncate_to_width(n.as_i64(), width.size())),
    }
}

fn write_scalar(
    memory: &mut CallMemory<'_>,
    addr: u32,
    width: Width,
    seed: Option<Number>,
) -> anyhow::Result<()> {
    let seed = seed.unwrap_or(Number::Int(0));

    match width {
        Width::I8 => memory.write(addr, seed.as_i64() as i8),
        Width::I16 => memory.write(addr, seed.as_i64() as i16),
        Width::I32 => memory.write(addr, seed.as_i64() as i32),
        Width::I64 => memory.write(addr, seed.as_i64()),
        Width::F32 => memory.write(addr, seed.as_f64() as f32),
        Width::F64 => memory.write(addr, seed.as_f64()),
        Width::Ptr => memory.write(addr, seed.as_i64() as u32),
    }
}

fn read_scalar(memory: &CallMemory<'_>, addr: u32, width: Width) -> anyhow::Result<Number> {
    Ok(match width {
        Width::I8 => Number::Int(memory.read::<i8>(addr)?.into()),
        Width::I16 => Number::Int(memory.read::<i16>(addr)?.into()),
        Width::I32 => Number::Int(memory.read::<i32>(addr)?.into()),
        Width::I64 => Number::Int(memory.read::<i64>(addr)?),
        Width::F32 => Number::Float(memory.read::<f32>(addr)?.into()),
        Width::F64 => Number::Float(memory.read::<f64>(addr)?),
        Width::Ptr => Number::Int(memory.read::<u32>(addr)?.into()),
    })
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        format!("native routine panicked: {msg}")
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        format!("native routine panicked: {msg}")
    } else {
        "native routine panicked".to_string()
    }
}
