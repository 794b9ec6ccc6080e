//! Core reducer: readiness tracking, bucket launch, and finalization.
//!
//! The reducer interlocks a concurrent producer (the differentiation
//! engine firing post-accumulation hooks) with a sequential consumer (the
//! collective library). One mutex serializes every mutation; the hook path
//! never blocks inside it, only launching non-blocking collectives and
//! stashing their handles. Waiting happens in `finalize_backward`, which
//! the engine invokes as a queued callback once the backward pass drains.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Once, Weak};
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::reducer::assignment::compute_bucket_assignment_by_size;
use crate::reducer::bucket::{Bucket, BucketReplica, VariableIndex, VariableLocator};
use crate::reducer::comm_hook::{CommHook, GradBucket};
use crate::reducer::options::ReducerOptions;
use crate::runtime::autograd::{self, AccumulatorId, Engine, HookToken, RpcContext, Variable};
use crate::runtime::comm::{ProcessGroup, Work};
use crate::runtime::device::Device;
use crate::runtime::dtype::DType;
use crate::runtime::tensor::Tensor;

static STRIDE_MISMATCH_WARNING: Once = Once::new();

/// Per-iteration mutable state, guarded by the reducer mutex.
pub(crate) struct ReducerState {
    pub(crate) buckets: Vec<Bucket>,
    pub(crate) variable_locators: Vec<VariableLocator>,
    /// True between `prepare_for_backward` and `finalize_backward`.
    expect_autograd_hooks: bool,
    /// True once any variable was marked ready; cleared by finalize. A set
    /// flag at the next `prepare_for_backward` means the previous iteration
    /// never finished.
    require_finalize: bool,
    /// Next bucket to launch; buckets reduce in index order.
    next_bucket: usize,
    has_marked_unused_parameters: bool,
    unused_parameters: Vec<VariableIndex>,
    /// Unused parameters already marked ready this iteration. A later hook
    /// for one of these is the only legal duplicate ready signal.
    marked_unused: HashSet<VariableIndex>,
    /// Host-side per-replica usage bitmaps (i32, one entry per parameter).
    local_used_maps: Vec<Tensor>,
    /// Device-side staging of the usage bitmaps for the allreduce.
    local_used_maps_dev: Vec<Tensor>,
    local_used_work: Option<Box<dyn Work>>,
    local_used_maps_reduced: bool,
    backward_stats_base: Option<Instant>,
    backward_stats: Vec<Vec<u64>>,
    has_rebuilt_bucket: bool,
    rebuilt_params: Vec<Variable>,
    rebuilt_param_indices: Vec<usize>,
    comm_hook: Option<Box<dyn CommHook>>,
    /// First error raised on the hook path; surfaced at the next finalize
    /// or prepare call since hooks cannot return through the engine.
    deferred_error: Option<Error>,
}

/// Synchronizes parameter gradients across data-parallel replicas.
///
/// As gradients become available during the backward pass, the reducer
/// copies them into byte-bounded flat buckets and launches one allreduce
/// per bucket at the earliest correct moment, preserving a deterministic
/// reduction order across all participating processes.
///
/// # Usage
///
/// ```ignore
/// let reducer = Reducer::new(
///     replicas,
///     bucket_indices,
///     process_group,
///     Vec::new(),
///     engine.clone(),
///     ReducerOptions::default(),
/// )?;
///
/// for batch in data {
///     reducer.prepare_forward()?;
///     let outputs = model.forward(batch);
///     reducer.prepare_for_backward(&outputs)?;
///     engine.backward(&outputs); // hooks fire, buckets launch
///     // finalize_backward runs as an engine callback; gradients are
///     // averaged and ready for the optimizer step.
/// }
/// ```
pub struct Reducer {
    pub(crate) replicas: Vec<Vec<Variable>>,
    pub(crate) process_group: Arc<dyn ProcessGroup>,
    pub(crate) expect_sparse_gradients: Vec<Vec<bool>>,
    options: ReducerOptions,
    engine: Arc<Engine>,
    /// Accumulator identity → parameter position, used by the graph walk to
    /// spot parameters whose accumulator never appears.
    func: HashMap<AccumulatorId, VariableIndex>,
    pub(crate) state: Mutex<ReducerState>,
    rpc_context: RpcContext,
    hook_tokens: Mutex<Vec<HookToken>>,
    weak_self: Weak<Reducer>,
}

impl Reducer {
    /// Construct a reducer over the given replicas and initial bucket
    /// layout.
    ///
    /// Verifies replica agreement within the process and across processes
    /// (broadcasting replica 0's metadata from rank 0), initializes the
    /// bucket layout, and registers one post-accumulation hook per
    /// parameter with the engine. Hooks are deregistered on drop.
    ///
    /// # Errors
    ///
    /// Fails on an empty replica list, mismatched `expect_sparse_gradients`
    /// shape, parameters disagreeing across replicas or processes, or an
    /// invalid bucket layout.
    pub fn new(
        replicas: Vec<Vec<Variable>>,
        bucket_indices: Vec<Vec<usize>>,
        process_group: Arc<dyn ProcessGroup>,
        expect_sparse_gradients: Vec<Vec<bool>>,
        engine: Arc<Engine>,
        options: ReducerOptions,
    ) -> Result<Arc<Reducer>> {
        if replicas.is_empty() {
            return Err(Error::Config {
                reason: "expected at least one model replica".to_string(),
            });
        }
        if replicas[0].is_empty() {
            return Err(Error::Config {
                reason: "expected at least one parameter".to_string(),
            });
        }
        let replica_count = replicas.len();
        let variable_count = replicas[0].len();
        if variable_count > i32::MAX as usize {
            return Err(Error::Config {
                reason: format!(
                    "models with more than {} parameters are unsupported: \
                     bucket layouts are exchanged as 32-bit indices",
                    i32::MAX
                ),
            });
        }

        let expect_sparse_gradients = if expect_sparse_gradients.is_empty() {
            vec![vec![false; variable_count]; replica_count]
        } else {
            if expect_sparse_gradients.len() != replica_count {
                return Err(Error::Config {
                    reason: "expect_sparse_gradients must have one entry per replica".to_string(),
                });
            }
            expect_sparse_gradients
        };

        let mut func = HashMap::with_capacity(replica_count * variable_count);
        for (replica_index, replica) in replicas.iter().enumerate() {
            for (variable_index, variable) in replica.iter().enumerate() {
                func.insert(
                    variable.accumulator(),
                    VariableIndex {
                        replica_index,
                        variable_index,
                    },
                );
            }
        }

        // Usage bitmaps exist only when unused-parameter detection is on;
        // with the flag off every parameter reduces anyway.
        let mut local_used_maps = Vec::new();
        let mut local_used_maps_dev = Vec::new();
        if options.find_unused_parameters {
            for replica in &replicas {
                local_used_maps.push(Tensor::zeros(&[variable_count], DType::I32, Device::Cpu));
                // Collective backends may not accept host tensors, so the
                // reduced map lives on the replica's device.
                local_used_maps_dev.push(Tensor::zeros(
                    &[variable_count],
                    DType::I32,
                    replica[0].device(),
                ));
            }
        }

        let reducer = Arc::new_cyclic(|weak| Reducer {
            replicas,
            process_group,
            expect_sparse_gradients,
            options,
            engine: Arc::clone(&engine),
            func,
            state: Mutex::new(ReducerState {
                buckets: Vec::new(),
                variable_locators: Vec::new(),
                expect_autograd_hooks: false,
                require_finalize: false,
                next_bucket: 0,
                has_marked_unused_parameters: false,
                unused_parameters: Vec::new(),
                marked_unused: HashSet::new(),
                local_used_maps,
                local_used_maps_dev,
                local_used_work: None,
                local_used_maps_reduced: false,
                backward_stats_base: None,
                backward_stats: vec![vec![0; variable_count]; replica_count],
                has_rebuilt_bucket: false,
                rebuilt_params: Vec::new(),
                rebuilt_param_indices: Vec::new(),
                comm_hook: None,
                deferred_error: None,
            }),
            rpc_context: RpcContext::new(),
            hook_tokens: Mutex::new(Vec::new()),
            weak_self: weak.clone(),
        });

        reducer.verify_replicas_within_process()?;
        reducer.verify_replica0_across_processes()?;

        {
            let mut state = reducer.state.lock();
            reducer.initialize_buckets_locked(&mut state, bucket_indices)?;
        }

        // One post-accumulation hook per parameter. The closures capture a
        // weak observer only: after drop deregisters the tokens (or the
        // upgrade fails), firing them is a no-op.
        let mut tokens = Vec::with_capacity(replica_count * variable_count);
        for (replica_index, replica) in reducer.replicas.iter().enumerate() {
            for (variable_index, variable) in replica.iter().enumerate() {
                let index = VariableIndex {
                    replica_index,
                    variable_index,
                };
                let weak = Arc::downgrade(&reducer);
                tokens.push(engine.add_post_hook(variable.accumulator(), move || {
                    if let Some(reducer) = weak.upgrade() {
                        reducer.rpc_context.set(autograd::current_context());
                        if let Err(err) = reducer.autograd_hook(index) {
                            reducer.record_hook_error(err);
                        }
                    }
                }));
            }
        }
        *reducer.hook_tokens.lock() = tokens;

        Ok(reducer)
    }

    /// The bucket layout currently in effect, as parameter indices per
    /// bucket in reduction order.
    pub fn bucket_indices(&self) -> Vec<Vec<usize>> {
        self.state
            .lock()
            .buckets
            .iter()
            .map(|bucket| bucket.variable_indices.clone())
            .collect()
    }

    /// Per-(replica, variable) nanoseconds from the start of the backward
    /// pass to the completion of the variable's ready signal.
    pub fn backward_stats(&self) -> Vec<Vec<u64>> {
        self.state.lock().backward_stats.clone()
    }

    /// Register a communication hook. May be called at most once and only
    /// with a single replica per process.
    pub fn register_comm_hook(&self, hook: Box<dyn CommHook>) -> Result<()> {
        let mut state = self.state.lock();
        if state.comm_hook.is_some() {
            return Err(Error::Config {
                reason: "register_comm_hook can only be called once".to_string(),
            });
        }
        if self.replicas.len() != 1 {
            return Err(Error::Config {
                reason: "communication hooks do not support single-process multiple-device mode"
                    .to_string(),
            });
        }
        state.comm_hook = Some(hook);
        Ok(())
    }

    pub(crate) fn record_hook_error(&self, err: Error) {
        let mut state = self.state.lock();
        if state.deferred_error.is_none() {
            state.deferred_error = Some(err);
        }
    }

    /// Rebuild buckets from first-iteration gradient arrival order if a
    /// rebuild is pending. Call before each forward pass.
    pub fn prepare_forward(&self) -> Result<()> {
        let mut state = self.state.lock();
        self.rebuild_buckets_locked(&mut state)
    }

    /// Reset per-iteration state ahead of a backward pass.
    ///
    /// With unused-parameter detection enabled, walks the differentiation
    /// graph from `outputs` and records every parameter whose accumulator
    /// is unreachable; those are marked ready (with zeroed bucket slots) on
    /// the first hook firing of the iteration.
    ///
    /// # Errors
    ///
    /// Fails if the previous iteration never finalized, which indicates a
    /// parameter that produced no gradient while unused-parameter detection
    /// was off, or an error raised on the hook path.
    pub fn prepare_for_backward(&self, outputs: &[Variable]) -> Result<()> {
        let mut state = self.state.lock();

        if let Some(err) = state.deferred_error.take() {
            return Err(err);
        }
        if state.require_finalize {
            return Err(Error::Protocol {
                reason: "expected to have finished reduction in the prior iteration before \
                         starting a new one. This indicates that your module has parameters \
                         that were not used in producing its output (the return value of \
                         `forward`). You can enable unused-parameter detection by setting \
                         `find_unused_parameters`, and make sure all outputs participate in \
                         computing the loss"
                    .to_string(),
            });
        }

        state.expect_autograd_hooks = true;
        state.next_bucket = 0;
        state.backward_stats_base = Some(Instant::now());
        for bucket in &mut state.buckets {
            for replica in &mut bucket.replicas {
                replica.pending = replica.variables.len();
            }
            bucket.pending = bucket.replicas.len();
        }

        state.has_marked_unused_parameters = false;
        state.unused_parameters.clear();
        state.marked_unused.clear();

        // With detection off, hooks for every parameter are assumed to
        // fire; there is nothing to search for.
        if !self.options.find_unused_parameters {
            return Ok(());
        }

        let mut seen_nodes = HashSet::new();
        let mut seen_accumulators = HashSet::new();
        let mut queue: Vec<_> = outputs.iter().filter_map(|output| output.grad_fn()).collect();
        while let Some(node) = queue.pop() {
            if !seen_nodes.insert(Arc::as_ptr(&node)) {
                continue;
            }
            if let Some(accumulator) = node.accumulator_id() {
                seen_accumulators.insert(accumulator);
            }
            for edge in node.next_edges() {
                queue.push(Arc::clone(edge));
            }
        }

        let mut unused: Vec<VariableIndex> = self
            .func
            .iter()
            .filter(|(accumulator, _)| !seen_accumulators.contains(accumulator))
            .map(|(_, &index)| index)
            .collect();
        unused.sort_by_key(|index| (index.replica_index, index.variable_index));
        state.unused_parameters = unused;

        Ok(())
    }

    /// Entry point for the post-accumulation hook of one parameter.
    ///
    /// Stamps the local usage bitmap, records arrival order for the bucket
    /// rebuild, pre-marks unused parameters on the first firing of the
    /// iteration, then marks the parameter ready.
    pub fn autograd_hook(&self, index: VariableIndex) -> Result<()> {
        let mut state = self.state.lock();

        if self.options.find_unused_parameters {
            // Repeated writes across gradient-accumulation iterations are
            // idempotent; used once means used.
            state.local_used_maps[index.replica_index].set_i32(index.variable_index, 1)?;
        }

        // The engine may fire hooks while the user accumulates gradients
        // without reducing (no prepare_for_backward); ignore those.
        if !state.expect_autograd_hooks {
            return Ok(());
        }

        // Arrival order of replica 0 drives the one-shot bucket rebuild.
        // Unsupported alongside unused-parameter detection, where arrival
        // order is incomplete by definition.
        if !state.has_rebuilt_bucket
            && !self.options.find_unused_parameters
            && index.replica_index == 0
        {
            state
                .rebuilt_params
                .push(self.replicas[index.replica_index][index.variable_index].clone());
            state.rebuilt_param_indices.push(index.variable_index);
        }

        if !state.has_marked_unused_parameters && self.options.find_unused_parameters {
            state.has_marked_unused_parameters = true;
            let unused = state.unused_parameters.clone();
            for unused_index in unused {
                self.mark_variable_ready(&mut state, unused_index)?;
                state.marked_unused.insert(unused_index);
            }
        }

        self.mark_variable_ready(&mut state, index)
    }

    fn mark_variable_ready(&self, state: &mut ReducerState, index: VariableIndex) -> Result<()> {
        let replica_index = index.replica_index;
        let variable_index = index.variable_index;
        if replica_index >= self.replicas.len() {
            return Err(Error::Protocol {
                reason: format!("out of range replica index {replica_index}"),
            });
        }
        if variable_index >= state.variable_locators.len() {
            return Err(Error::Protocol {
                reason: format!("out of range variable index {variable_index}"),
            });
        }

        if let Some(base) = state.backward_stats_base {
            state.backward_stats[replica_index][variable_index] = base.elapsed().as_nanos() as u64;
        }

        // Any ready signal obligates a finalize before the next iteration.
        state.require_finalize = true;

        // A pre-marked unused parameter may still fire its hook later (for
        // example from a re-entrant backward); its slot was already counted,
        // so the duplicate signal is dropped.
        if state.marked_unused.contains(&index) {
            return Ok(());
        }

        let locator = state.variable_locators[variable_index];
        if state.buckets[locator.bucket_index].replicas[replica_index].pending == 0 {
            return Err(Error::Protocol {
                reason: format!(
                    "expected variable {variable_index} to be marked ready only once. This is \
                     caused by use of a parameter outside the `forward` function, by reusing \
                     parameters across re-entrant backward passes, or by incorrect \
                     unused-parameter detection when an ignored output joins the graph later"
                ),
            });
        }

        if state.buckets[locator.bucket_index].expect_sparse_gradient {
            self.mark_variable_ready_sparse(state, index)?;
        } else {
            self.mark_variable_ready_dense(state, index)?;
        }

        let bucket = &mut state.buckets[locator.bucket_index];
        let replica = &mut bucket.replicas[replica_index];
        replica.pending -= 1;
        if replica.pending == 0 {
            bucket.pending -= 1;
            if bucket.pending == 0 {
                self.mark_bucket_ready(state, locator.bucket_index)?;
            }
        }

        // Once the final bucket has launched, kick off the usage-bitmap
        // reduction (so it can never complete before any gradient
        // reduction) and queue finalize on the engine.
        if state.next_bucket == state.buckets.len() {
            self.launch_used_map_reduction(state)?;

            let weak = self.weak_self.clone();
            self.engine.queue_callback(Box::new(move || {
                if let Some(reducer) = weak.upgrade() {
                    if let Err(err) = reducer.finalize_backward() {
                        reducer.record_hook_error(err);
                    }
                }
            }));
        }

        Ok(())
    }

    fn mark_variable_ready_dense(
        &self,
        state: &mut ReducerState,
        index: VariableIndex,
    ) -> Result<()> {
        let locator = state.variable_locators[index.variable_index];
        let replica = &state.buckets[locator.bucket_index].replicas[index.replica_index];
        let variable = replica.variables[locator.intra_bucket_index].clone();
        let bucket_view = replica.bucket_views[locator.intra_bucket_index].clone();
        let world_size = self.process_group.size();
        let has_hook = state.comm_hook.is_some();

        let mut outcome: Result<()> = Ok(());
        self.run_grad_callback(&variable, &mut |grad| match grad {
            Some(g) if !g.is_alias_of(&bucket_view) => {
                if g.dtype() != bucket_view.dtype() {
                    outcome = Err(Error::DTypeMismatch {
                        expected: bucket_view.dtype(),
                        got: g.dtype(),
                    });
                    return false;
                }
                if g.device() != bucket_view.device() {
                    outcome = Err(Error::Protocol {
                        reason: format!(
                            "gradient on {} does not match bucket view on {}",
                            g.device(),
                            bucket_view.device()
                        ),
                    });
                    return false;
                }
                if g.numel() != bucket_view.numel() {
                    outcome = Err(Error::Protocol {
                        reason: format!(
                            "gradient holds {} elements but its bucket view holds {}",
                            g.numel(),
                            bucket_view.numel()
                        ),
                    });
                    return false;
                }
                // Accumulation is not obliged to honor the layout contract;
                // the penalty for a mismatch is copy bandwidth, not wrong
                // numerics, since the same view transform applies on both
                // ends of the reduction.
                if g.strides() != bucket_view.strides() {
                    STRIDE_MISMATCH_WARNING.call_once(|| {
                        warn!(
                            "gradient strides do not match bucket view strides; this may \
                             indicate the parameter's layout changed after construction and \
                             can impair performance"
                        );
                    });
                }
                let copied = if has_hook {
                    // The hook owns the scaling contract; hand it raw sums.
                    bucket_view.copy_from(g)
                } else {
                    // Divide by world size while copying, in one pass.
                    bucket_view.copy_from_scaled(g, 1.0 / world_size as f64)
                };
                if let Err(err) = copied {
                    outcome = Err(err.into());
                    return false;
                }
                // Redirect the grad at the view so subsequent iterations
                // write the bucket directly and skip this copy.
                *grad = Some(bucket_view.clone());
                true
            }
            Some(_) => {
                if !has_hook {
                    if let Err(err) = bucket_view.div_scalar(world_size as f64) {
                        outcome = Err(err.into());
                    }
                }
                false
            }
            None => {
                bucket_view.fill_zero();
                false
            }
        });
        outcome
    }

    fn mark_variable_ready_sparse(
        &self,
        state: &mut ReducerState,
        index: VariableIndex,
    ) -> Result<()> {
        let locator = state.variable_locators[index.variable_index];
        let variable = state.buckets[locator.bucket_index].replicas[index.replica_index].variables
            [locator.intra_bucket_index]
            .clone();
        let world_size = self.process_group.size();
        let has_hook = state.comm_hook.is_some();

        let mut outcome: Result<()> = Ok(());
        let mut captured: Option<Tensor> = None;
        self.run_grad_callback(&variable, &mut |grad| match grad {
            Some(g) if g.is_sparse() => {
                captured = Some(g.clone());
                true
            }
            Some(_) => {
                outcome = Err(Error::Protocol {
                    reason: format!(
                        "expected variable {} to have a sparse gradient",
                        index.variable_index
                    ),
                });
                false
            }
            None => {
                outcome = Err(Error::Protocol {
                    reason: "expected sparse gradient to be defined".to_string(),
                });
                false
            }
        });
        outcome?;
        let grad = captured.ok_or_else(|| Error::Protocol {
            reason: "sparse gradient disappeared while marking ready".to_string(),
        })?;

        // Sparse gradients cannot coalesce; the gradient itself becomes the
        // bucket contents and is reduced (and updated) in place.
        if !has_hook {
            grad.div_scalar(world_size as f64)?;
        }
        state.buckets[locator.bucket_index].replicas[index.replica_index].contents = Some(grad);
        Ok(())
    }

    /// Called when every replica of the bucket at `bucket_index` completed.
    /// Launches reductions in bucket-index order, deferring out-of-order
    /// completions until their predecessors are ready.
    fn mark_bucket_ready(&self, state: &mut ReducerState, bucket_index: usize) -> Result<()> {
        if bucket_index < state.next_bucket {
            return Err(Error::Protocol {
                reason: format!(
                    "bucket {bucket_index} marked ready after reduction already launched"
                ),
            });
        }
        if bucket_index > state.next_bucket {
            return Ok(());
        }

        while state.next_bucket < state.buckets.len()
            && state.buckets[state.next_bucket].pending == 0
        {
            let launch_index = state.next_bucket;
            let mut tensors = Vec::with_capacity(state.buckets[launch_index].replicas.len());
            for replica in &state.buckets[launch_index].replicas {
                let contents = replica.contents.clone().ok_or_else(|| Error::Protocol {
                    reason: format!("bucket {launch_index} has no contents to reduce"),
                })?;
                tensors.push(contents);
            }
            debug!(
                rank = self.process_group.rank(),
                bucket = launch_index,
                "launching bucket reduction"
            );
            match state.comm_hook.as_mut() {
                None => {
                    state.buckets[launch_index].work =
                        Some(self.process_group.allreduce(&tensors));
                }
                Some(hook) => {
                    state.buckets[launch_index].future_work =
                        Some(hook.run_hook(GradBucket::new(tensors)));
                }
            }
            state.next_bucket += 1;
        }
        Ok(())
    }

    fn launch_used_map_reduction(&self, state: &mut ReducerState) -> Result<()> {
        if !self.options.find_unused_parameters {
            return Ok(());
        }
        for index in 0..state.local_used_maps.len() {
            state.local_used_maps_dev[index].copy_from(&state.local_used_maps[index])?;
        }
        state.local_used_work = Some(self.process_group.allreduce(&state.local_used_maps_dev));
        Ok(())
    }

    /// Install the bucket layout described by `bucket_indices`.
    ///
    /// Must not run while autograd hooks are expected. The indices must
    /// partition the parameter index range exactly.
    pub fn initialize_buckets(&self, bucket_indices: Vec<Vec<usize>>) -> Result<()> {
        let mut state = self.state.lock();
        self.initialize_buckets_locked(&mut state, bucket_indices)
    }

    pub(crate) fn initialize_buckets_locked(
        &self,
        state: &mut ReducerState,
        bucket_indices: Vec<Vec<usize>>,
    ) -> Result<()> {
        // Between iterations gradients may already alias bucket views, and
        // mutating them must route through the active context if any.
        self.rpc_context.set(autograd::current_context());

        if state.expect_autograd_hooks {
            return Err(Error::Protocol {
                reason: "initialize_buckets must not be called during autograd execution"
                    .to_string(),
            });
        }

        state.buckets.clear();
        let variable_count = self.replicas[0].len();
        state.variable_locators = vec![VariableLocator::default(); variable_count];

        let mut assigned = vec![false; variable_count];
        for indices in &bucket_indices {
            for &variable_index in indices {
                if variable_index >= variable_count {
                    return Err(Error::Config {
                        reason: format!("out of range variable index {variable_index}"),
                    });
                }
                if assigned[variable_index] {
                    return Err(Error::Config {
                        reason: format!(
                            "variable {variable_index} assigned to more than one bucket"
                        ),
                    });
                }
                assigned[variable_index] = true;
            }
        }
        if let Some(missing) = assigned.iter().position(|&a| !a) {
            return Err(Error::Config {
                reason: format!("variable {missing} is not assigned to any bucket"),
            });
        }

        for (bucket_index, indices) in bucket_indices.into_iter().enumerate() {
            if indices.is_empty() {
                return Err(Error::Config {
                    reason: "empty bucket specified".to_string(),
                });
            }

            // Sparse-gradient variables keep a bucket to themselves.
            let expect_sparse_gradient = if indices.len() == 1 {
                self.expect_sparse_gradients[0][indices[0]]
            } else {
                for &variable_index in &indices {
                    if self.expect_sparse_gradients[0][variable_index] {
                        return Err(Error::Config {
                            reason: "buckets with more than one variable cannot include \
                                     variables that expect a sparse gradient"
                                .to_string(),
                        });
                    }
                }
                false
            };

            let mut bucket = Bucket::new(indices, expect_sparse_gradient);

            for replica_index in 0..self.replicas.len() {
                let mut replica = BucketReplica::default();

                if bucket.expect_sparse_gradient {
                    let variable_index = bucket.variable_indices[0];
                    replica
                        .variables
                        .push(self.replicas[replica_index][variable_index].clone());
                } else {
                    let mut dtype: Option<DType> = None;
                    let mut device: Option<Device> = None;
                    let mut offset = 0;
                    for &variable_index in &bucket.variable_indices {
                        let variable = &self.replicas[replica_index][variable_index];
                        match device {
                            None => device = Some(variable.device()),
                            Some(expected) if expected != variable.device() => {
                                return Err(Error::Config {
                                    reason:
                                        "all parameters in a bucket must be placed on the same \
                                         device"
                                            .to_string(),
                                });
                            }
                            Some(_) => {}
                        }
                        match dtype {
                            None => dtype = Some(variable.dtype()),
                            Some(expected) if expected != variable.dtype() => {
                                return Err(Error::Config {
                                    reason: "all parameters in a bucket must have the same dtype"
                                        .to_string(),
                                });
                            }
                            Some(_) => {}
                        }
                        let length = variable.numel();
                        replica.variables.push(variable.clone());
                        replica.offsets.push(offset);
                        replica.lengths.push(length);
                        offset += length;
                    }
                    let (Some(dtype), Some(device)) = (dtype, device) else {
                        return Err(Error::Config {
                            reason: "empty bucket specified".to_string(),
                        });
                    };

                    let contents = Tensor::zeros(&[offset], dtype, device);
                    replica.contents = Some(contents.clone());
                    self.initialize_bucket_views(&mut replica, &contents, true)?;
                }

                bucket.replicas.push(replica);
            }

            // The locator mapping is identical across replicas.
            for (intra_bucket_index, &variable_index) in
                bucket.variable_indices.iter().enumerate()
            {
                state.variable_locators[variable_index] = VariableLocator {
                    bucket_index,
                    intra_bucket_index,
                };
            }

            state.buckets.push(bucket);
        }

        Ok(())
    }

    /// Build one aliasing view per variable into `contents`.
    ///
    /// A parameter with dense, non-overlapping memory gets a view matching
    /// its own sizes and strides, anticipating that gradient accumulation
    /// produces gradients in the same layout; anything else gets a row-major
    /// contiguous view. Every process derives the view purely from
    /// parameter metadata, so the layout agrees across ranks whenever the
    /// parameters do.
    ///
    /// Defined gradients that do not already alias their view are
    /// redirected at it; when `copy_to_bucket_view` is set (bucket
    /// initialization and rebuild) their current values are copied in
    /// first. Undefined gradients stay undefined so globally unused
    /// parameters keep theirs.
    pub(crate) fn initialize_bucket_views(
        &self,
        replica: &mut BucketReplica,
        contents: &Tensor,
        copy_to_bucket_view: bool,
    ) -> Result<()> {
        replica.bucket_views.clear();
        for intra_bucket_index in 0..replica.variables.len() {
            let variable = replica.variables[intra_bucket_index].clone();
            let offset = replica.offsets[intra_bucket_index];
            let length = replica.lengths[intra_bucket_index];

            let bucket_view = if variable.data().is_non_overlapping_and_dense() {
                contents.as_strided(variable.shape(), variable.strides(), offset)?
            } else {
                contents.narrow(0, offset, length)?.view(variable.shape())?
            };
            replica.bucket_views.push(bucket_view.clone());

            let mut outcome: Result<()> = Ok(());
            self.run_grad_callback(&variable, &mut |grad| {
                if let Some(g) = grad {
                    if !g.is_alias_of(&bucket_view) {
                        if copy_to_bucket_view {
                            if let Err(err) = bucket_view.copy_from(g) {
                                outcome = Err(err.into());
                                return false;
                            }
                        }
                        *grad = Some(bucket_view.clone());
                        return true;
                    }
                }
                false
            });
            outcome?;
        }
        Ok(())
    }

    /// Wait on every outstanding reduction in bucket order, restore
    /// per-parameter gradients from the reduced buckets, and reset
    /// per-iteration state.
    ///
    /// Runs as an engine callback queued when the final bucket launches;
    /// it may also be driven directly by callers that own the backward
    /// loop.
    pub fn finalize_backward(&self) -> Result<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        if let Some(err) = state.deferred_error.take() {
            return Err(err);
        }
        if !state.expect_autograd_hooks {
            return Err(Error::Protocol {
                reason: "finalize_backward called without a matching prepare_for_backward"
                    .to_string(),
            });
        }
        if !state.require_finalize {
            return Err(Error::Protocol {
                reason: "finalize_backward called but no variable was marked ready".to_string(),
            });
        }
        if state.next_bucket != state.buckets.len() {
            return Err(Error::Protocol {
                reason: format!(
                    "finalize_backward called with {} of {} buckets launched",
                    state.next_bucket,
                    state.buckets.len()
                ),
            });
        }
        state.expect_autograd_hooks = false;
        state.require_finalize = false;

        for bucket_index in 0..state.buckets.len() {
            if let Some(hook) = state.comm_hook.as_mut() {
                let mut future = state.buckets[bucket_index].future_work.take().ok_or_else(
                    || Error::Protocol {
                        reason: format!(
                            "expected future work for bucket {bucket_index}; the communication \
                             hook was not properly installed"
                        ),
                    },
                )?;
                future.wait()?;
                let results = hook.process_future(future.take_value())?;
                let replica_count = state.buckets[bucket_index].replicas.len();
                if results.len() != replica_count {
                    return Err(Error::Protocol {
                        reason: format!(
                            "communication hook returned {} tensors for {} replicas",
                            results.len(),
                            replica_count
                        ),
                    });
                }
                for (replica_index, result) in results.into_iter().enumerate() {
                    if state.buckets[bucket_index].expect_sparse_gradient {
                        let contents = state.buckets[bucket_index].replicas[replica_index]
                            .contents
                            .clone()
                            .ok_or_else(|| Error::Protocol {
                                reason: format!(
                                    "sparse bucket {bucket_index} has no contents to restore"
                                ),
                            })?;
                        contents.copy_from(&result)?;
                    } else {
                        // The hook result is the authoritative contents;
                        // re-point the views (and through them, the
                        // gradients) at it.
                        let replica = &mut state.buckets[bucket_index].replicas[replica_index];
                        replica.contents = Some(result.clone());
                        self.initialize_bucket_views(replica, &result, false)?;
                    }
                }
            } else {
                let mut work =
                    state.buckets[bucket_index]
                        .work
                        .take()
                        .ok_or_else(|| Error::Protocol {
                            reason: format!(
                                "expected work handle for bucket {bucket_index}; allreduce \
                                 hooks were not properly installed"
                            ),
                        })?;
                work.wait()?;
            }

            // Sparse buckets need no restore step: the gradient and the
            // contents are the same tensor.
            if !state.buckets[bucket_index].expect_sparse_gradient {
                self.finalize_bucket_dense(state, bucket_index)?;
            }
        }

        if self.options.find_unused_parameters {
            for map in &state.local_used_maps {
                map.fill_zero();
            }
            // If no parameter was locally unused, nothing waited on the
            // usage reduction during the dense pass. Wait now so the next
            // iteration's staging copy cannot clobber in-flight memory.
            if !state.local_used_maps_reduced {
                if let Some(mut work) = state.local_used_work.take() {
                    work.wait()?;
                }
            }
            state.local_used_maps_reduced = false;
        }

        Ok(())
    }

    fn finalize_bucket_dense(&self, state: &mut ReducerState, bucket_index: usize) -> Result<()> {
        let replica_count = state.buckets[bucket_index].replicas.len();
        for replica_index in 0..replica_count {
            let variable_count = state.buckets[bucket_index].replicas[replica_index]
                .variables
                .len();
            for intra_bucket_index in 0..variable_count {
                let variable = state.buckets[bucket_index].replicas[replica_index].variables
                    [intra_bucket_index]
                    .clone();

                let mut global_unused = false;
                if self.options.find_unused_parameters {
                    let variable_index =
                        state.buckets[bucket_index].variable_indices[intra_bucket_index];
                    // Locally used implies globally used; only a locally
                    // unused parameter needs the reduced consensus, so the
                    // wait on the usage reduction is deferred until one
                    // shows up.
                    global_unused =
                        state.local_used_maps[replica_index].i32_at(variable_index)? == 0;
                    if global_unused && !state.local_used_maps_reduced {
                        let mut work =
                            state.local_used_work.take().ok_or_else(|| Error::Protocol {
                                reason: "usage-bitmap reduction was never launched".to_string(),
                            })?;
                        work.wait()?;
                        for index in 0..state.local_used_maps.len() {
                            state.local_used_maps[index]
                                .copy_from(&state.local_used_maps_dev[index])?;
                        }
                        global_unused =
                            state.local_used_maps[replica_index].i32_at(variable_index)? == 0;
                        state.local_used_maps_reduced = true;
                    }
                }

                let bucket_view = state.buckets[bucket_index].replicas[replica_index].bucket_views
                    [intra_bucket_index]
                    .clone();
                let mut outcome: Result<()> = Ok(());
                self.run_grad_callback(&variable, &mut |grad| {
                    // A globally unused parameter keeps its gradient
                    // untouched, defined or not.
                    if global_unused {
                        return false;
                    }
                    match grad {
                        None => {
                            // Globally used but locally unused: adopt the
                            // reduced bucket slot.
                            *grad = Some(bucket_view.clone());
                            true
                        }
                        Some(g) => {
                            if !g.is_alias_of(&bucket_view) {
                                outcome = Err(Error::Protocol {
                                    reason: "gradient should alias its bucket view once marked \
                                             ready"
                                        .to_string(),
                                });
                                return false;
                            }
                            true
                        }
                    }
                });
                outcome?;
            }
        }
        Ok(())
    }

    fn rebuild_buckets_locked(&self, state: &mut ReducerState) -> Result<()> {
        if state.rebuilt_params.is_empty() {
            return Ok(());
        }
        if state.rebuilt_params.len() != state.rebuilt_param_indices.len() {
            return Err(Error::Protocol {
                reason: format!(
                    "recorded {} rebuild parameters but {} indices",
                    state.rebuilt_params.len(),
                    state.rebuilt_param_indices.len()
                ),
            });
        }
        if state.rebuilt_param_indices.len() != self.replicas[0].len() {
            return Err(Error::Protocol {
                reason: format!(
                    "recorded {} rebuild parameters but the model has {}",
                    state.rebuilt_param_indices.len(),
                    self.replicas[0].len()
                ),
            });
        }

        let size_limits = [self.options.first_bucket_bytes, self.options.bucket_bytes_cap];
        let tensors: Vec<Tensor> = state
            .rebuilt_params
            .iter()
            .map(|variable| variable.data().clone())
            .collect();
        let mut rebuilt = compute_bucket_assignment_by_size(
            &tensors,
            &size_limits,
            &self.expect_sparse_gradients[0],
            &state.rebuilt_param_indices,
        )?;
        debug!(
            buckets = rebuilt.len(),
            "rebuilt bucket assignment from gradient arrival order"
        );

        // Only rank 0's layout survives; everyone adopts it.
        self.sync_bucket_indices(&mut rebuilt)?;

        state.has_rebuilt_bucket = true;
        state.rebuilt_params.clear();
        state.rebuilt_param_indices.clear();

        self.initialize_buckets_locked(state, rebuilt)
    }

    /// Mutate a variable's gradient, routing through the distributed
    /// autograd context when one was active at hook time.
    pub(crate) fn run_grad_callback(
        &self,
        variable: &Variable,
        callback: &mut dyn FnMut(&mut Option<Tensor>) -> bool,
    ) {
        match self.rpc_context.get() {
            Some(context) => context.run_grad_callback(variable, callback),
            None => {
                variable.with_grad_mut(|grad| {
                    callback(grad);
                });
            }
        }
    }
}

impl std::fmt::Debug for Reducer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Reducer")
            .field("replicas", &self.replicas.len())
            .field("variables", &self.replicas[0].len())
            .field("buckets", &state.buckets.len())
            .field("world_size", &self.process_group.size())
            .field("find_unused_parameters", &self.options.find_unused_parameters)
            .finish()
    }
}

impl Drop for Reducer {
    fn drop(&mut self) {
        // Deregister every hook so a recovered reducer on the same
        // parameters never races a dangling observer.
        let tokens = std::mem::take(&mut *self.hook_tokens.lock());
        for token in tokens {
            if !self.engine.del_post_hook(token) {
                tracing::error!("reducer attempted to delete a non-existing hook");
            }
        }
    }
}
