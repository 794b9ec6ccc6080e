//! Differentiation-engine seam.
//!
//! The reducer rides on an external differentiation engine: it registers a
//! post-accumulation hook per parameter, discovers unused parameters by
//! walking the graph reachable from the forward outputs, and queues its
//! finalize step as an engine callback. This module models that contract:
//! [`Variable`] parameter handles with a shared gradient slot, [`GraphNode`]
//! graph vertices, and the [`Engine`] hook registry and callback queue.
//! Hooks are owned by the engine and deregistered by token; a hook whose
//! observer has been dropped is inert.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::runtime::device::Device;
use crate::runtime::dtype::DType;
use crate::runtime::tensor::Tensor;

static NEXT_ACCUMULATOR_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a parameter's gradient-accumulation node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AccumulatorId(u64);

impl AccumulatorId {
    fn fresh() -> Self {
        Self(NEXT_ACCUMULATOR_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// A parameter handle.
///
/// Clones share both the data tensor and the gradient slot, mirroring how
/// an engine hands the same leaf out to every holder. The gradient slot is
/// `None` until the engine (or the reducer) populates it.
#[derive(Clone)]
pub struct Variable {
    data: Tensor,
    grad: Arc<RwLock<Option<Tensor>>>,
    requires_grad: bool,
    accumulator: AccumulatorId,
    grad_fn: Option<Arc<GraphNode>>,
}

impl Variable {
    /// Create a variable with an explicit `requires_grad` flag.
    pub fn new(data: Tensor, requires_grad: bool) -> Variable {
        Variable {
            data,
            grad: Arc::new(RwLock::new(None)),
            requires_grad,
            accumulator: AccumulatorId::fresh(),
            grad_fn: None,
        }
    }

    /// Create a leaf parameter (requires a gradient).
    pub fn leaf(data: Tensor) -> Variable {
        Variable::new(data, true)
    }

    /// Create a forward output backed by a graph node.
    pub fn from_forward(data: Tensor, grad_fn: Arc<GraphNode>) -> Variable {
        Variable {
            data,
            grad: Arc::new(RwLock::new(None)),
            requires_grad: true,
            accumulator: AccumulatorId::fresh(),
            grad_fn: Some(grad_fn),
        }
    }

    /// The parameter data.
    pub fn data(&self) -> &Tensor {
        &self.data
    }

    /// Clone of the current gradient handle, if defined.
    pub fn grad(&self) -> Option<Tensor> {
        self.grad.read().clone()
    }

    /// Replace the gradient slot.
    pub fn set_grad(&self, grad: Option<Tensor>) {
        *self.grad.write() = grad;
    }

    /// Run a callback with mutable access to the gradient slot.
    ///
    /// The callback's return value reports whether it modified the slot;
    /// direct mutation ignores it, but context-mediated mutation (see
    /// [`GradContext`]) may use it to decide on a write-back.
    pub fn with_grad_mut<R>(&self, f: impl FnOnce(&mut Option<Tensor>) -> R) -> R {
        f(&mut self.grad.write())
    }

    /// Whether this variable expects a gradient.
    pub fn requires_grad(&self) -> bool {
        self.requires_grad
    }

    /// Identity of this variable's gradient accumulator.
    pub fn accumulator(&self) -> AccumulatorId {
        self.accumulator
    }

    /// The graph node that produced this variable, if any. Leaves have none.
    pub fn grad_fn(&self) -> Option<Arc<GraphNode>> {
        self.grad_fn.clone()
    }

    /// Shape of the data tensor.
    pub fn shape(&self) -> &[usize] {
        self.data.shape()
    }

    /// Strides of the data tensor.
    pub fn strides(&self) -> &[usize] {
        self.data.strides()
    }

    /// DType of the data tensor.
    pub fn dtype(&self) -> DType {
        self.data.dtype()
    }

    /// Device of the data tensor.
    pub fn device(&self) -> Device {
        self.data.device()
    }

    /// Element count of the data tensor.
    pub fn numel(&self) -> usize {
        self.data.numel()
    }
}

/// A vertex in the differentiation graph.
///
/// Interior nodes carry edges toward their inputs; accumulator nodes are
/// the leaves the unused-parameter walk looks for.
pub struct GraphNode {
    accumulator: Option<AccumulatorId>,
    next_edges: Vec<Arc<GraphNode>>,
}

impl GraphNode {
    /// An interior node with edges toward its inputs.
    pub fn interior(next_edges: Vec<Arc<GraphNode>>) -> Arc<GraphNode> {
        Arc::new(GraphNode {
            accumulator: None,
            next_edges,
        })
    }

    /// The accumulator leaf for a parameter.
    pub fn accumulator(id: AccumulatorId) -> Arc<GraphNode> {
        Arc::new(GraphNode {
            accumulator: Some(id),
            next_edges: Vec::new(),
        })
    }

    /// The accumulator this node represents, if it is a leaf.
    pub fn accumulator_id(&self) -> Option<AccumulatorId> {
        self.accumulator
    }

    /// Edges toward this node's inputs.
    pub fn next_edges(&self) -> &[Arc<GraphNode>] {
        &self.next_edges
    }
}

/// Registration token for a post-accumulation hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HookToken(u64);

type PostHook = Arc<dyn Fn() + Send + Sync>;

/// Hook registry and callback queue of the differentiation engine.
#[derive(Default)]
pub struct Engine {
    hooks: Mutex<HashMap<AccumulatorId, Vec<(HookToken, PostHook)>>>,
    callbacks: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
    next_token: AtomicU64,
}

impl Engine {
    /// Create an empty engine.
    pub fn new() -> Engine {
        Engine::default()
    }

    /// Register a hook to run after the given accumulator fires.
    pub fn add_post_hook(
        &self,
        accumulator: AccumulatorId,
        hook: impl Fn() + Send + Sync + 'static,
    ) -> HookToken {
        let token = HookToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        self.hooks
            .lock()
            .entry(accumulator)
            .or_default()
            .push((token, Arc::new(hook)));
        token
    }

    /// Remove a previously registered hook. Returns false if the token is
    /// unknown.
    pub fn del_post_hook(&self, token: HookToken) -> bool {
        let mut hooks = self.hooks.lock();
        for entries in hooks.values_mut() {
            if let Some(position) = entries.iter().position(|(t, _)| *t == token) {
                entries.remove(position);
                return true;
            }
        }
        false
    }

    /// Fire the post-accumulation hooks registered for an accumulator.
    pub fn run_post_hooks(&self, accumulator: AccumulatorId) {
        // Clone the hook list out so hooks run without the registry lock;
        // a hook may call back into code that registers or removes hooks.
        let entries: Vec<PostHook> = self
            .hooks
            .lock()
            .get(&accumulator)
            .map(|list| list.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default();
        for hook in entries {
            hook();
        }
    }

    /// Queue a callback to run when the current backward pass completes.
    pub fn queue_callback(&self, callback: Box<dyn FnOnce() + Send>) {
        self.callbacks.lock().push(callback);
    }

    /// Drain and run queued callbacks in FIFO order.
    pub fn run_callbacks(&self) {
        let callbacks: Vec<_> = std::mem::take(&mut *self.callbacks.lock());
        for callback in callbacks {
            callback();
        }
    }
}

/// Capability that owns gradient mutation while a distributed-autograd
/// context is active.
pub trait GradContext: Send + Sync {
    /// Mutate the variable's gradient through the context's own channel.
    /// The callback returns true if it modified the slot.
    fn run_grad_callback(
        &self,
        variable: &Variable,
        callback: &mut dyn FnMut(&mut Option<Tensor>) -> bool,
    );
}

thread_local! {
    static CURRENT_CONTEXT: RefCell<Option<Arc<dyn GradContext>>> = const { RefCell::new(None) };
}

/// Install (or clear) the calling thread's distributed-autograd context.
pub fn set_current_context(context: Option<Arc<dyn GradContext>>) {
    CURRENT_CONTEXT.with(|slot| *slot.borrow_mut() = context);
}

/// The calling thread's distributed-autograd context, if any.
pub fn current_context() -> Option<Arc<dyn GradContext>> {
    CURRENT_CONTEXT.with(|slot| slot.borrow().clone())
}

/// Write-once-per-value cell for the last context observed by a hook.
///
/// Hooks on different engine threads may race to record the context; the
/// raw-identity swap makes the holder update idempotent so every call site
/// observes one consistent pointer.
pub struct RpcContext {
    raw: AtomicUsize,
    holder: Mutex<Option<Arc<dyn GradContext>>>,
}

impl RpcContext {
    /// An empty cell.
    pub fn new() -> Self {
        Self {
            raw: AtomicUsize::new(0),
            holder: Mutex::new(None),
        }
    }

    /// Record the context, updating the holder only when the identity
    /// actually changed.
    pub fn set(&self, context: Option<Arc<dyn GradContext>>) {
        let raw = context
            .as_ref()
            .map_or(0, |c| Arc::as_ptr(c) as *const () as usize);
        if self.raw.swap(raw, Ordering::AcqRel) != raw {
            *self.holder.lock() = context;
        }
    }

    /// The last recorded context.
    pub fn get(&self) -> Option<Arc<dyn GradContext>> {
        self.holder.lock().clone()
    }
}

impl Default for RpcContext {
    fn default() -> Self {
        Self::new()
    }
}
