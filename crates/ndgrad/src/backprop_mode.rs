//! Backprop-mode scopes.
//!
//! Each context keeps a stack of mode frames. A frame targets either one
//! backprop id or every id of the context, and either decides (suppress /
//! force-enable graph construction) or explicitly defers to the frames below
//! it. Lookup walks the stack innermost first; the first matching frame that
//! decides wins. With no deciding frame, graph construction is enabled.
//!
//! Frames are pushed and popped by [`BackpropModeScope`] guards, so the stack
//! is restored on every exit path, unwinding included.

use crate::context::{BackpropId, Context};
use crate::error::{GradError, consistency_check};

/// Decision recorded by a mode frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackpropMode {
    /// Do not build graphs.
    Suppress,
    /// Build graphs even when an enclosing scope suppresses them.
    ForceEnable,
}

#[derive(Debug, Clone)]
pub(crate) struct ModeFrame {
    /// `None` targets every backprop id of the context.
    backprop_id: Option<BackpropId>,
    /// `None` defers to the enclosing frames.
    mode: Option<BackpropMode>,
}

impl ModeFrame {
    fn matches(&self, backprop_id: BackpropId) -> bool {
        self.backprop_id.is_none_or(|id| id == backprop_id)
    }
}

impl Context {
    /// Whether graph construction is currently enabled for `backprop_id`.
    pub fn is_backprop_required(&self, backprop_id: BackpropId) -> bool {
        self.mode_stack()
            .borrow()
            .iter()
            .rev()
            .filter(|frame| frame.matches(backprop_id))
            .find_map(|frame| frame.mode)
            .is_none_or(|mode| mode == BackpropMode::ForceEnable)
    }
}

/// Guard pushing mode frames onto a context's stack.
///
/// # Example
///
/// ```
/// use ndgrad::{BackpropModeScope, Context};
///
/// let ctx = Context::new();
/// let id = ctx.default_backprop_id();
/// {
///     let _scope = BackpropModeScope::no_backprop(&ctx, &[]).unwrap();
///     assert!(!ctx.is_backprop_required(id));
///     {
///         let _force = BackpropModeScope::force_backprop(&ctx, &[id]).unwrap();
///         assert!(ctx.is_backprop_required(id));
///     }
/// }
/// assert!(ctx.is_backprop_required(id));
/// ```
pub struct BackpropModeScope {
    context: Context,
    depth: usize,
    pushed: usize,
}

impl BackpropModeScope {
    /// Push one frame per id, or a single all-graphs frame when `backprop_ids`
    /// is empty. `mode == None` pushes frames that defer to enclosing scopes.
    pub fn new(
        context: &Context,
        mode: Option<BackpropMode>,
        backprop_ids: &[BackpropId],
    ) -> Result<Self, GradError> {
        for &id in backprop_ids {
            context.check_valid_backprop_id(id)?;
        }
        let mut stack = context.mode_stack().borrow_mut();
        let depth = stack.len();
        if backprop_ids.is_empty() {
            stack.push(ModeFrame {
                backprop_id: None,
                mode,
            });
        } else {
            stack.extend(backprop_ids.iter().map(|&id| ModeFrame {
                backprop_id: Some(id),
                mode,
            }));
        }
        let pushed = stack.len() - depth;
        Ok(Self {
            context: context.clone(),
            depth,
            pushed,
        })
    }

    /// Suppress graph construction for the given ids (all when empty).
    pub fn no_backprop(context: &Context, backprop_ids: &[BackpropId]) -> Result<Self, GradError> {
        Self::new(context, Some(BackpropMode::Suppress), backprop_ids)
    }

    /// Force graph construction for the given ids (all when empty).
    pub fn force_backprop(
        context: &Context,
        backprop_ids: &[BackpropId],
    ) -> Result<Self, GradError> {
        Self::new(context, Some(BackpropMode::ForceEnable), backprop_ids)
    }

    /// Push frames that make no decision of their own.
    pub fn inherit(context: &Context, backprop_ids: &[BackpropId]) -> Result<Self, GradError> {
        Self::new(context, None, backprop_ids)
    }
}

impl Drop for BackpropModeScope {
    fn drop(&mut self) {
        let mut stack = self.context.mode_stack().borrow_mut();
        consistency_check!(
            stack.len() == self.depth + self.pushed,
            "backprop mode scopes released out of order"
        );
        stack.truncate(self.depth);
    }
}
