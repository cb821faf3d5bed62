//! Contexts and backprop ids.
//!
//! A [`Context`] owns everything that is shared between the arrays created on
//! its devices: the registry of backprop ids (one per independent gradient
//! graph) and the backprop-mode stack consulted while graphs are built.
//!
//! Backprop ids are totally ordered within a context. An id made later is
//! "more inner" than every id made before it; the default id is the
//! outermost one.
//!
//! # Example
//!
//! ```
//! use ndgrad::{BackpropScope, Context};
//!
//! let ctx = Context::new();
//! let outer = ctx.default_backprop_id();
//! let scope = BackpropScope::new(&ctx, "inner");
//! assert!(outer < scope.backprop_id());
//! ```

use crate::backprop_mode::ModeFrame;
use crate::error::GradError;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};

static NEXT_CONTEXT_ID: AtomicUsize = AtomicUsize::new(0);

const DEFAULT_BACKPROP_NAME: &str = "<default>";

/// Identity of one gradient graph within a context.
///
/// Ordering is by creation: `a < b` means `a` is outer to `b`. Ids of
/// different contexts never compare equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BackpropId {
    context_id: usize,
    ordinal: usize,
}

impl BackpropId {
    /// Position of this id in its context's creation order.
    pub fn ordinal(&self) -> usize {
        self.ordinal
    }

    /// Id of the owning context.
    pub fn context_id(&self) -> usize {
        self.context_id
    }
}

#[derive(Debug)]
struct BackpropEntry {
    ordinal: usize,
    name: String,
    released: bool,
}

struct ContextInner {
    id: usize,
    next_ordinal: Cell<usize>,
    backprop_ids: RefCell<Vec<BackpropEntry>>,
    mode_stack: RefCell<Vec<ModeFrame>>,
}

/// Owner of backprop ids and of the backprop-mode stack.
///
/// Cloning a context yields another handle to the same state. A context is
/// meant to be driven from a single thread.
#[derive(Clone)]
pub struct Context {
    inner: Rc<ContextInner>,
}

impl Context {
    /// Create a context holding only its default backprop id.
    pub fn new() -> Self {
        let inner = ContextInner {
            id: NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed),
            next_ordinal: Cell::new(1),
            backprop_ids: RefCell::new(vec![BackpropEntry {
                ordinal: 0,
                name: DEFAULT_BACKPROP_NAME.to_string(),
                released: false,
            }]),
            mode_stack: RefCell::new(Vec::new()),
        };
        Self {
            inner: Rc::new(inner),
        }
    }

    /// Unique id of this context.
    pub fn id(&self) -> usize {
        self.inner.id
    }

    /// Whether both handles refer to the same context.
    pub fn ptr_eq(&self, other: &Context) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// The outermost backprop id, used whenever none is given.
    pub fn default_backprop_id(&self) -> BackpropId {
        BackpropId {
            context_id: self.inner.id,
            ordinal: 0,
        }
    }

    /// Create a backprop id more inner than every existing one.
    pub fn make_backprop_id(&self, name: impl Into<String>) -> BackpropId {
        let ordinal = self.inner.next_ordinal.get();
        self.inner.next_ordinal.set(ordinal + 1);
        self.inner.backprop_ids.borrow_mut().push(BackpropEntry {
            ordinal,
            name: name.into(),
            released: false,
        });
        BackpropId {
            context_id: self.inner.id,
            ordinal,
        }
    }

    /// Retire a backprop id. Later uses of it fail with
    /// [`GradError::BackpropIdReleased`].
    pub fn release_backprop_id(&self, backprop_id: BackpropId) -> Result<(), GradError> {
        self.check_valid_backprop_id(backprop_id)?;
        if backprop_id.ordinal == 0 {
            return Err(GradError::DefaultBackpropIdRelease);
        }
        let mut ids = self.inner.backprop_ids.borrow_mut();
        if let Some(entry) = ids.iter_mut().find(|e| e.ordinal == backprop_id.ordinal) {
            entry.released = true;
        }
        Ok(())
    }

    /// Check that the id belongs to this context and is still alive.
    pub fn check_valid_backprop_id(&self, backprop_id: BackpropId) -> Result<(), GradError> {
        if backprop_id.context_id != self.inner.id {
            return Err(GradError::ContextMismatch);
        }
        let ids = self.inner.backprop_ids.borrow();
        match ids.iter().find(|e| e.ordinal == backprop_id.ordinal) {
            Some(entry) if entry.released => Err(GradError::BackpropIdReleased {
                name: entry.name.clone(),
            }),
            Some(_) => Ok(()),
            None => Err(GradError::ContextMismatch),
        }
    }

    /// Resolve an optional id to a valid one, defaulting to the outermost.
    pub fn resolve_backprop_id(
        &self,
        backprop_id: Option<BackpropId>,
    ) -> Result<BackpropId, GradError> {
        let backprop_id = backprop_id.unwrap_or_else(|| self.default_backprop_id());
        self.check_valid_backprop_id(backprop_id)?;
        Ok(backprop_id)
    }

    /// Name given to the id at creation.
    pub fn backprop_id_name(&self, backprop_id: BackpropId) -> Option<String> {
        if backprop_id.context_id != self.inner.id {
            return None;
        }
        self.inner
            .backprop_ids
            .borrow()
            .iter()
            .find(|e| e.ordinal == backprop_id.ordinal)
            .map(|e| e.name.clone())
    }

    /// Live ids strictly more inner than `backprop_id`, outermost first.
    pub fn inner_backprop_ids(&self, backprop_id: BackpropId) -> Vec<BackpropId> {
        self.inner
            .backprop_ids
            .borrow()
            .iter()
            .filter(|e| !e.released && e.ordinal > backprop_id.ordinal)
            .map(|e| BackpropId {
                context_id: self.inner.id,
                ordinal: e.ordinal,
            })
            .collect()
    }

    pub(crate) fn mode_stack(&self) -> &RefCell<Vec<ModeFrame>> {
        &self.inner.mode_stack
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.inner.id)
            .field("backprop_ids", &self.inner.backprop_ids.borrow().len())
            .field("mode_frames", &self.inner.mode_stack.borrow().len())
            .finish()
    }
}

/// Scope owning a fresh backprop id.
///
/// The id is released when the scope is dropped.
pub struct BackpropScope {
    context: Context,
    backprop_id: BackpropId,
}

impl BackpropScope {
    /// Create a new, innermost backprop id on `context`.
    pub fn new(context: &Context, name: impl Into<String>) -> Self {
        let backprop_id = context.make_backprop_id(name);
        Self {
            context: context.clone(),
            backprop_id,
        }
    }

    /// The id owned by this scope.
    pub fn backprop_id(&self) -> BackpropId {
        self.backprop_id
    }
}

impl Drop for BackpropScope {
    fn drop(&mut self) {
        if let Err(err) = self.context.release_backprop_id(self.backprop_id) {
            log::warn!("failed to release backprop id: {err}");
        }
    }
}
