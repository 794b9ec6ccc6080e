//! Shared fixtures: in-process multi-rank process groups and parameter
//! helpers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use reducr::{CompletedWork, Device, ProcessGroup, Tensor, Variable, Work};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum OpKind {
    AllReduce,
    Broadcast,
}

struct Slot {
    op: OpKind,
    contributions: Vec<Option<Vec<Tensor>>>,
    completed: bool,
}

/// Rendezvous point shared by the rank threads of one test world.
///
/// Collectives contribute their operand lists at initiation, keyed by a
/// per-rank call sequence number; ranks issue identical call sequences, so
/// equal numbers rendezvous. The op executes inside `wait` once every rank
/// has contributed, writing results into every rank's tensors.
pub struct CollectiveWorld {
    world_size: usize,
    slots: Mutex<HashMap<u64, Slot>>,
    condvar: Condvar,
}

impl CollectiveWorld {
    pub fn new(world_size: usize) -> Arc<Self> {
        Arc::new(Self {
            world_size,
            slots: Mutex::new(HashMap::new()),
            condvar: Condvar::new(),
        })
    }

    fn contribute(&self, seq: u64, rank: usize, op: OpKind, tensors: Vec<Tensor>) {
        let mut slots = self.slots.lock();
        let world_size = self.world_size;
        let slot = slots.entry(seq).or_insert_with(|| Slot {
            op,
            contributions: vec![None; world_size],
            completed: false,
        });
        assert_eq!(slot.op, op, "ranks disagree on collective {seq}");
        assert!(
            slot.contributions[rank].is_none(),
            "rank {rank} contributed twice to collective {seq}"
        );
        slot.contributions[rank] = Some(tensors);
        self.condvar.notify_all();
    }

    fn wait_complete(&self, seq: u64) -> reducr::Result<()> {
        let mut slots = self.slots.lock();
        loop {
            let slot = slots
                .get_mut(&seq)
                .expect("wait on a collective that was never initiated");
            if slot.contributions.iter().all(|c| c.is_some()) {
                if !slot.completed {
                    execute(slot);
                    slot.completed = true;
                    self.condvar.notify_all();
                }
                return Ok(());
            }
            self.condvar.wait(&mut slots);
        }
    }
}

fn execute(slot: &mut Slot) {
    let all: Vec<&Vec<Tensor>> = slot
        .contributions
        .iter()
        .map(|c| c.as_ref().expect("all contributions present"))
        .collect();
    match slot.op {
        OpKind::AllReduce => {
            let mut tensors = all.iter().flat_map(|list| list.iter());
            let first = tensors.next().expect("allreduce over empty operand list");
            let mut sum = first.to_f64_vec();
            for tensor in tensors {
                for (acc, value) in sum.iter_mut().zip(tensor.to_f64_vec()) {
                    *acc += value;
                }
            }
            for list in &all {
                for tensor in list.iter() {
                    tensor.copy_from_f64(&sum).expect("allreduce write-back");
                }
            }
        }
        OpKind::Broadcast => {
            let source = all[0][0].to_f64_vec();
            for list in &all {
                for tensor in list.iter() {
                    tensor.copy_from_f64(&source).expect("broadcast write-back");
                }
            }
        }
    }
}

struct RendezvousWork {
    world: Arc<CollectiveWorld>,
    seq: u64,
}

impl Work for RendezvousWork {
    fn wait(&mut self) -> reducr::Result<()> {
        self.world.wait_complete(self.seq)
    }
}

/// One rank's endpoint into a [`CollectiveWorld`].
pub struct ThreadedProcessGroup {
    world: Arc<CollectiveWorld>,
    rank: usize,
    seq: AtomicU64,
}

impl ThreadedProcessGroup {
    pub fn new(world: Arc<CollectiveWorld>, rank: usize) -> Self {
        Self {
            world,
            rank,
            seq: AtomicU64::new(0),
        }
    }
}

impl ProcessGroup for ThreadedProcessGroup {
    fn broadcast(&self, tensors: &[Tensor]) -> Box<dyn Work> {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        self.world
            .contribute(seq, self.rank, OpKind::Broadcast, tensors.to_vec());
        Box::new(RendezvousWork {
            world: Arc::clone(&self.world),
            seq,
        })
    }

    fn allreduce(&self, tensors: &[Tensor]) -> Box<dyn Work> {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        self.world
            .contribute(seq, self.rank, OpKind::AllReduce, tensors.to_vec());
        Box::new(RendezvousWork {
            world: Arc::clone(&self.world),
            seq,
        })
    }

    fn size(&self) -> usize {
        self.world.world_size
    }

    fn rank(&self) -> usize {
        self.rank
    }
}

/// Single-process stand-in that reports a configurable world size but
/// leaves operands untouched, as if every rank contributed identical
/// values and the average undid the sum.
pub struct FakeSizeGroup {
    pub world_size: usize,
}

impl ProcessGroup for FakeSizeGroup {
    fn broadcast(&self, _tensors: &[Tensor]) -> Box<dyn Work> {
        Box::new(CompletedWork::ok())
    }

    fn allreduce(&self, _tensors: &[Tensor]) -> Box<dyn Work> {
        Box::new(CompletedWork::ok())
    }

    fn size(&self) -> usize {
        self.world_size
    }

    fn rank(&self) -> usize {
        0
    }
}

/// Identity group that records the element count of each allreduce
/// operand, in launch order.
pub struct RecordingGroup {
    pub launches: Arc<Mutex<Vec<usize>>>,
}

impl RecordingGroup {
    pub fn new() -> Self {
        Self {
            launches: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl ProcessGroup for RecordingGroup {
    fn broadcast(&self, _tensors: &[Tensor]) -> Box<dyn Work> {
        Box::new(CompletedWork::ok())
    }

    fn allreduce(&self, tensors: &[Tensor]) -> Box<dyn Work> {
        self.launches.lock().push(tensors[0].numel());
        Box::new(CompletedWork::ok())
    }

    fn size(&self) -> usize {
        1
    }

    fn rank(&self) -> usize {
        0
    }
}

/// Leaf parameter with the given values.
pub fn leaf_f32(values: &[f32], shape: &[usize]) -> Variable {
    Variable::leaf(Tensor::from_slice(values, shape, Device::Cpu))
}

/// Write gradient values, reusing the existing gradient tensor when the
/// variable has one (the engine accumulates in place once the gradient
/// aliases its bucket view).
pub fn write_grad(variable: &Variable, values: &[f32]) {
    let update = Tensor::from_slice(values, variable.shape(), Device::Cpu);
    match variable.grad() {
        Some(grad) => grad.copy_from(&update).expect("gradient write"),
        None => variable.set_grad(Some(update)),
    }
}

/// The variable's gradient as a flat f32 vector.
pub fn grad_vec(variable: &Variable) -> Vec<f32> {
    variable
        .grad()
        .expect("gradient should be defined")
        .to_vec::<f32>()
        .expect("gradient should be f32")
}
