use std::fmt;

use rustc_hash::FxHashMap;
use seclink::Value;
use seclink_protocol::{ArgMap as WireArgs, InnerApi};
use tracing::warn;

use crate::{ApiError, OutCell, PromiseResolver, SharedBuffer};

// === Targets === //

/// Where a routine's updated argument lands on the caller side.
#[derive(Debug, Clone)]
pub enum UpdateTarget {
    Cell(OutCell),
    Buffer(SharedBuffer),
}

/// Routine argument name to the caller container it came from.
pub type UpdateMap = FxHashMap<String, UpdateTarget>;

/// Writes a call's updated arguments back into the caller's containers. Cells are only written
/// when `write_cells` is set; detached buffers are always reattached.
pub fn apply_updates(mut updates: UpdateMap, update_args: WireArgs, write_cells: bool) {
    for (name, value) in update_args {
        match (updates.remove(&name), value) {
            (Some(UpdateTarget::Buffer(target)), Value::Buffer(buffer)) => target.attach(buffer),
            (Some(UpdateTarget::Cell(target)), Value::Cell(value)) => {
                if write_cells {
                    target.set(value);
                }
            }
            (Some(_), value) => {
                warn!(arg = %name, "ignoring update of unexpected shape {}", value.shape());
            }
            (None, _) => {}
        }
    }

    for (name, target) in updates {
        if matches!(target, UpdateTarget::Buffer(_)) {
            warn!(arg = %name, "buffer was not returned by the worker");
        }
    }
}

// === Ledger === //

#[derive(Debug)]
pub enum PendingOp {
    Init(PromiseResolver<InnerApi, ApiError>),
    Call {
        procedure: String,
        resolver: PromiseResolver<Value, ApiError>,
        updates: UpdateMap,
    },
    Destroy(PromiseResolver<(), ApiError>),
}

impl PendingOp {
    /// Whether the caller dropped the future waiting on this operation.
    pub fn is_orphaned(&self) -> bool {
        match self {
            PendingOp::Init(resolver) => resolver.is_cancelled(),
            PendingOp::Call { resolver, .. } => resolver.is_cancelled(),
            PendingOp::Destroy(resolver) => resolver.is_cancelled(),
        }
    }
}

impl fmt::Display for PendingOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PendingOp::Init(_) => f.write_str("init"),
            PendingOp::Call { procedure, .. } => write!(f, "call to `{procedure}`"),
            PendingOp::Destroy(_) => f.write_str("destroy"),
        }
    }
}

/// Holds the single outstanding operation of a session.
#[derive(Debug, Default)]
pub struct Ledger {
    pending: Option<PendingOp>,
}

impl Ledger {
    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn pending(&self) -> Option<&PendingOp> {
        self.pending.as_ref()
    }

    /// Fails with [`ApiError::OperationInProgress`] while another operation is outstanding.
    pub fn check_idle(&self) -> Result<(), ApiError> {
        match &self.pending {
            Some(op) => Err(ApiError::OperationInProgress(op.to_string())),
            None => Ok(()),
        }
    }

    pub fn begin(&mut self, op: PendingOp) -> Result<(), ApiError> {
        self.check_idle()?;
        self.pending = Some(op);
        Ok(())
    }

    pub fn take(&mut self) -> Option<PendingOp> {
        self.pending.take()
    }
}
