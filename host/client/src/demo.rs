//! A small native surface for exercising sessions without a real native library.

use anyhow::Context as _;
use seclink::{NativeArg, NativeFault, NativeSurface, NativeValue, Value};

/// The handle returned by `demo_context_create`.
pub const DEMO_CONTEXT: u32 = 0x5ec0;

/// The size of the keys `demo_copy` moves.
pub const DEMO_KEY_LEN: u32 = 32;

const DEMO_FLAGS: i64 = 0x0101;

pub fn demo_surface() -> NativeSurface {
    NativeSurface::builder()
        .routine(
            "demo_context_create",
            &[("flags", "i32")],
            "p",
            |_, args| {
                if args[0].as_int() != Some(DEMO_FLAGS) {
                    return Err(NativeFault::new("unsupported context flags"));
                }

                Ok(NativeValue::Ptr(DEMO_CONTEXT))
            },
        )
        .routine("demo_context_destroy", &[("ctx", "ic")], "v", |_, args| {
            check_context(args)?;
            Ok(NativeValue::Void)
        })
        .routine(
            "demo_copy",
            &[
                ("ctx", "ic"),
                ("input", "i[8]"),
                ("output", "o[8]"),
                ("len", "o32"),
            ],
            "32",
            |mem, args| {
                check_context(args)?;

                mem.copy_within(ptr(args[1])?, ptr(args[2])?, DEMO_KEY_LEN)
                    .context("keys must be 32 bytes long")?;
                mem.write::<u32>(ptr(args[3])?, DEMO_KEY_LEN)?;

                Ok(NativeValue::Int(1))
            },
        )
        .routine(
            "demo_sum",
            &[("values", "i[32]"), ("count", "i32"), ("total", "o64")],
            "32",
            |mem, args| {
                let count = u32::try_from(args[1].as_int().unwrap_or(0))
                    .context("`count` must not be negative")?;

                let total = mem
                    .read_slice::<i32>(ptr(args[0])?, count)
                    .context("`values` is shorter than `count`")?
                    .iter()
                    .map(|&v| i64::from(v))
                    .sum::<i64>();

                mem.write(ptr(args[2])?, total)?;

                Ok(NativeValue::Int(1))
            },
        )
        .routine(
            "demo_xor",
            &[("data", "o[8]"), ("len", "i32"), ("key", "is")],
            "32",
            |mem, args| {
                let key = args[2].as_str().unwrap_or_default().as_bytes();
                if key.is_empty() {
                    return Ok(NativeValue::Int(0));
                }

                let len = u32::try_from(args[1].as_int().unwrap_or(0))
                    .context("`len` must not be negative")?;

                for (byte, k) in mem.bytes_mut(ptr(args[0])?, len)?.iter_mut().zip(key.iter().cycle()) {
                    *byte ^= k;
                }

                Ok(NativeValue::Int(1))
            },
        )
        .context(
            "demo_context_create",
            vec![Value::int(DEMO_FLAGS)],
            "demo_context_destroy",
        )
}

fn check_context(args: &[NativeArg<'_>]) -> Result<(), NativeFault> {
    match args[0].as_ptr() {
        Some(DEMO_CONTEXT) => Ok(()),
        _ => Err(NativeFault::new("invalid context")),
    }
}

fn ptr(arg: NativeArg<'_>) -> anyhow::Result<u32> {
    arg.as_ptr().context("expected an address")
}
