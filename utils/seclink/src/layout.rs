use anyhow::Context;

use crate::{ArgKind, ArgSpec, Direction, Width, utils::align_up};

// === Plan === //

/// A scalar or pointer output living at a fixed offset of the scratch region.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct FixedSlot {
    pub arg: usize,
    pub width: Width,
    pub offset: u32,
}

/// A buffer argument placed in the variable zone. Its offset depends on the lengths of the
/// buffers supplied to a given call.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct VarSlot {
    pub arg: usize,
    pub elem: Width,
    pub direction: Direction,
}

/// The scratch layout of a single function, computed once when its wrapper is built.
///
/// The region starts with the fixed zone: every fixed output, packed from offset zero in
/// decreasing width order so that no slot needs padding. The zone is then rounded up to the
/// widest element width of the variable zone, which holds the buffers in decreasing element
/// width order with outputs ahead of inputs of the same width.
#[derive(Debug, Clone)]
pub struct LayoutPlan {
    fixed: Vec<FixedSlot>,
    vars: Vec<VarSlot>,
    fixed_bytes: u32,
    fixed_size: u32,
    align: u32,
}

impl LayoutPlan {
    pub fn new(args: &[ArgSpec]) -> Self {
        // Fixed zone
        let mut fixed = Vec::new();

        for size in [8, 4, 2, 1] {
            for (arg, spec) in args.iter().enumerate() {
                match spec.kind {
                    ArgKind::FixedOut(width) if width.size() == size => {
                        fixed.push(FixedSlot {
                            arg,
                            width,
                            offset: 0,
                        });
                    }
                    _ => {}
                }
            }
        }

        let mut fixed_bytes = 0;
        for slot in &mut fixed {
            slot.offset = fixed_bytes;
            fixed_bytes += slot.width.size();
        }

        // Variable zone
        let mut vars = args
            .iter()
            .enumerate()
            .filter_map(|(arg, spec)| match spec.kind {
                ArgKind::VarOut(elem) => Some(VarSlot {
                    arg,
                    elem,
                    direction: Direction::Out,
                }),
                ArgKind::VarIn(elem) => Some(VarSlot {
                    arg,
                    elem,
                    direction: Direction::In,
                }),
                _ => None,
            })
            .collect::<Vec<_>>();

        // Stable, so declaration order breaks the remaining ties.
        vars.sort_by_key(|slot| {
            (
                std::cmp::Reverse(slot.elem.size()),
                slot.direction == Direction::In,
            )
        });

        let align = vars.iter().map(|slot| slot.elem.size()).max().unwrap_or(1);

        // A function has at most a handful of fixed outputs so this can't overflow.
        let fixed_size = align_up(fixed_bytes, align).unwrap_or(fixed_bytes);

        Self {
            fixed,
            vars,
            fixed_bytes,
            fixed_size,
            align,
        }
    }

    pub fn fixed_slots(&self) -> &[FixedSlot] {
        &self.fixed
    }

    pub fn fixed_slot(&self, arg: usize) -> Option<&FixedSlot> {
        self.fixed.iter().find(|slot| slot.arg == arg)
    }

    pub fn var_slots(&self) -> &[VarSlot] {
        &self.vars
    }

    pub fn align(&self) -> u32 {
        self.align
    }

    /// The sum of the fixed slot widths.
    pub fn fixed_bytes(&self) -> u32 {
        self.fixed_bytes
    }

    /// The size of the fixed zone including the padding that aligns the variable zone.
    pub fn fixed_size(&self) -> u32 {
        self.fixed_size
    }

    /// Computes the offsets of the variable zone for one call. `byte_lens` holds the byte length
    /// of every variable slot in placement order.
    pub fn place(&self, byte_lens: &[u32]) -> anyhow::Result<Placement> {
        anyhow::ensure!(
            byte_lens.len() == self.vars.len(),
            "expected {} variable regions, got {}",
            self.vars.len(),
            byte_lens.len(),
        );

        let mut offsets = Vec::with_capacity(self.vars.len());
        let mut cursor = self.fixed_size;

        for (slot, &len) in self.vars.iter().zip(byte_lens) {
            let start = align_up(cursor, slot.elem.size())
                .context("scratch region size overflows the address space")?;

            offsets.push(start);

            cursor = start
                .checked_add(len)
                .context("scratch region size overflows the address space")?;
        }

        Ok(Placement {
            offsets,
            total: cursor,
        })
    }
}

/// The per-call offsets of the variable zone, in the plan's placement order.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Placement {
    pub offsets: Vec<u32>,
    pub total: u32,
}

// === Tests === //
