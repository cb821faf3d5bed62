//! Reverse-mode automatic differentiation over multiple graphs.
//!
//! Every backprop id of a [`Context`](crate::Context) names an independent
//! graph. An array takes part in a graph through an [`ArrayNode`]; an
//! operation invocation appears in a graph as an [`OpNode`] owning the backward
//! functions registered by the operation.
//!
//! # Architecture
//!
//! ```text
//! ArrayBody ──owns──► ArrayNode ──owns──► OpNode ──owns──► input ArrayNodes
//!     ▲                   │                  │
//!     └──────weak─────────┘                  └──weak──► output ArrayNodes
//! ```
//!
//! Operations record themselves with a [`BackwardBuilder`]; [`backward`]
//! replays the recorded graph in reverse and accumulates gradients on the
//! array nodes. Passing [`DoubleBackpropOption::Enable`] keeps the graph and
//! records the backward computations on outer backprop ids, which makes
//! gradients differentiable again.
//!
//! # Key Types
//!
//! - [`BackwardBuilder`] / [`Target`]: graph construction for operations
//! - [`BackwardContext`]: what a backward function sees while it runs
//! - [`RetainedInputToken`] / [`RetainedOutputToken`]: access to forward values
//! - [`backward`] / [`grad`]: the backward pass

mod array_node;
mod backward;
mod backward_builder;
mod backward_context;
mod gradient;
mod op_node;
mod retained;

pub use array_node::{ArrayNode, ArrayProps};
pub(crate) use array_node::validate_gradient;
pub use backward::{DoubleBackpropOption, backward, grad};
pub use backward_builder::{BackwardBuilder, Target};
pub use backward_context::BackwardContext;
pub use gradient::GradientHolder;
pub use op_node::{BackwardEntry, BackwardFunction, OpNode};
pub use retained::{RetainedInputToken, RetainedOutputToken};
