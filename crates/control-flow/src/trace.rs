//! The ambient capture session.
//!
//! At most one capture session is active per thread, entered by [`capture`]
//! and torn down on every exit path by an RAII guard. While a session is
//! active, [`Value`](crate::value::Value) operations record into the
//! innermost open tape frame; tracing a branch pushes a frame, runs the
//! callable, and folds the frame into a [`Subprogram`]. Values referenced by
//! a branch but defined outside its frame are lifted into the sub-program's
//! explicit operand list with their capture-time tensors, so the capture is
//! replayable without reaching back into host closures.

use std::cell::RefCell;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

use candle_core::Tensor;

use crate::error::{precondition, ControlFlowError, Result};
use crate::graph::{LeafSpec, Op, ProgramArena, Subprogram, SubprogramId, ValueId};
use crate::pytree::PyTree;
use crate::value::Value;

static NEXT_VALUE_ID: AtomicU64 = AtomicU64::new(0);

pub(crate) fn next_value_id() -> ValueId {
    ValueId(NEXT_VALUE_ID.fetch_add(1, Ordering::Relaxed))
}

struct Frame {
    defined: HashSet<ValueId>,
    lifted: Vec<(ValueId, Tensor)>,
    ops: Vec<Op>,
}

struct Session {
    arena: ProgramArena,
    frames: Vec<Frame>,
}

thread_local! {
    static SESSION: RefCell<Option<Session>> = const { RefCell::new(None) };
}

/// Whether a capture session is ambient on this thread.
pub fn is_capturing() -> bool {
    SESSION.with(|s| s.borrow().is_some())
}

/// Record one operation into the innermost open frame. Inputs that the frame
/// neither received as operands nor produced itself are lifted. Outside a
/// session, or outside any frame, this is a no-op and execution stays eager.
pub(crate) fn record(op: Op, inputs: &[(ValueId, &Tensor)]) {
    SESSION.with(|s| {
        let mut borrow = s.borrow_mut();
        let Some(session) = borrow.as_mut() else {
            return;
        };
        let Some(frame) = session.frames.last_mut() else {
            return;
        };
        for (id, tensor) in inputs {
            if !frame.defined.contains(id) && !frame.lifted.iter().any(|(l, _)| l == id) {
                frame.lifted.push((*id, (*tensor).clone()));
            }
        }
        frame.defined.extend(op.outputs.iter().copied());
        frame.ops.push(op);
    });
}

/// Trace one branch callable into a sub-program. The frame is popped on
/// every exit path, including an erroring branch.
pub(crate) fn trace_subprogram<F>(
    inputs: &PyTree<Value>,
    f: F,
) -> Result<(PyTree<Value>, SubprogramId)>
where
    F: FnOnce(&PyTree<Value>) -> Result<PyTree<Value>>,
{
    let (in_leaves, input_structure) = inputs.flatten();
    let input_ids: Vec<ValueId> = in_leaves.iter().map(|v| v.id()).collect();
    let input_specs: Vec<LeafSpec> = in_leaves.iter().map(|v| LeafSpec::of(v.tensor())).collect();

    SESSION.with(|s| -> Result<()> {
        let mut borrow = s.borrow_mut();
        let session = borrow
            .as_mut()
            .ok_or_else(|| precondition("capture", "no capture session is active"))?;
        session.frames.push(Frame {
            defined: input_ids.iter().copied().collect(),
            lifted: Vec::new(),
            ops: Vec::new(),
        });
        Ok(())
    })?;

    let result = f(inputs);

    let frame = SESSION
        .with(|s| s.borrow_mut().as_mut().and_then(|session| session.frames.pop()))
        .expect("frame pushed above");

    let outputs = result?;
    let sub = {
        let (out_leaves, output_structure) = outputs.flatten();
        Subprogram {
            inputs: input_ids,
            lifted: frame.lifted,
            outputs: out_leaves.iter().map(|v| v.id()).collect(),
            ops: frame.ops,
            input_structure,
            output_structure,
            input_specs,
            output_specs: out_leaves.iter().map(|v| LeafSpec::of(v.tensor())).collect(),
        }
    };
    let id = SESSION
        .with(|s| s.borrow_mut().as_mut().map(|session| session.arena.insert(sub)))
        .expect("session active");
    log::debug!("captured sub-program {:?}", id);
    Ok((outputs, id))
}

/// Borrow a captured sub-program from the active session.
pub(crate) fn with_subprogram<R>(
    id: SubprogramId,
    f: impl FnOnce(&Subprogram) -> Result<R>,
) -> Result<R> {
    SESSION.with(|s| {
        let borrow = s.borrow();
        let session = borrow
            .as_ref()
            .ok_or_else(|| precondition("capture", "no capture session is active"))?;
        f(session.arena.get(id))
    })
}

/// Replay a sub-program captured in the active session.
pub(crate) fn replay_active(id: SubprogramId, inputs: &[Tensor]) -> Result<Vec<Tensor>> {
    SESSION.with(|s| {
        let borrow = s.borrow();
        let session = borrow
            .as_ref()
            .ok_or_else(|| precondition("capture", "no capture session is active"))?;
        session.arena.replay(id, inputs)
    })
}

struct SessionGuard {
    finished: bool,
}

impl SessionGuard {
    fn enter() -> Result<Self> {
        SESSION.with(|s| {
            let mut borrow = s.borrow_mut();
            if borrow.is_some() {
                return Err(precondition(
                    "capture",
                    "a capture session is already active on this thread; \
                     nest control-flow operators inside the existing capture instead",
                ));
            }
            *borrow = Some(Session {
                arena: ProgramArena::new(),
                frames: Vec::new(),
            });
            Ok(SessionGuard { finished: false })
        })
    }

    fn finish(mut self) -> Session {
        self.finished = true;
        SESSION
            .with(|s| s.borrow_mut().take())
            .expect("session active")
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if !self.finished {
            SESSION.with(|s| {
                s.borrow_mut().take();
            });
        }
    }
}

/// A finished capture: the arena of every sub-program recorded during the
/// session plus the root that represents the traced callable itself.
#[derive(Debug)]
pub struct CapturedProgram {
    arena: ProgramArena,
    root: SubprogramId,
}

impl CapturedProgram {
    pub fn root_id(&self) -> SubprogramId {
        self.root
    }

    pub fn root(&self) -> &Subprogram {
        self.arena.get(self.root)
    }

    pub fn arena(&self) -> &ProgramArena {
        &self.arena
    }

    pub fn subprogram(&self, id: SubprogramId) -> &Subprogram {
        self.arena.get(id)
    }

    /// Replay the whole capture on fresh operand leaves.
    pub fn replay(&self, inputs: &[Tensor]) -> Result<Vec<Tensor>> {
        self.arena.replay(self.root, inputs)
    }

    /// Replay one captured sub-program (for example a single `cond` branch).
    pub fn replay_subprogram(&self, id: SubprogramId, inputs: &[Tensor]) -> Result<Vec<Tensor>> {
        self.arena.replay(id, inputs)
    }
}

/// Capture a callable over the given operands.
///
/// Exactly one capture session may be open per thread; control-flow
/// operators invoked inside `f` record themselves as single nodes and
/// capture their branches into the same arena.
pub fn capture<F>(operands: PyTree<Tensor>, f: F) -> Result<(PyTree<Tensor>, CapturedProgram)>
where
    F: FnOnce(&PyTree<Value>) -> Result<PyTree<Value>>,
{
    let guard = SessionGuard::enter()?;
    let inputs = operands.try_map(&mut |t: &Tensor| {
        Ok::<_, ControlFlowError>(Value::new(t.clone()))
    })?;
    let (outputs, root) = trace_subprogram(&inputs, f)?;
    let session = guard.finish();
    let out_tensors =
        outputs.try_map(&mut |v: &Value| Ok::<_, ControlFlowError>(v.tensor().clone()))?;
    log::info!(
        "capture session closed: {} sub-programs, root has {} ops",
        session.arena.len(),
        session.arena.get(root).ops.len()
    );
    Ok((
        out_tensors,
        CapturedProgram {
            arena: session.arena,
            root,
        },
    ))
}

/// Run `f` inside a throwaway session; used by operators that need a
/// structural look at a callable even when no capture is ambient.
pub(crate) fn with_private_session<R>(f: impl FnOnce() -> Result<R>) -> Result<R> {
    let guard = SessionGuard::enter()?;
    let result = f();
    let _ = guard.finish();
    result
}
