//! Seams onto the reducer's external collaborators: tensors, collectives,
//! and the differentiation engine.

pub mod autograd;
pub mod comm;
pub mod device;
pub mod dtype;
pub mod tensor;

pub use autograd::{AccumulatorId, Engine, GradContext, GraphNode, HookToken, RpcContext, Variable};
pub use comm::{CompletedWork, LocalProcessGroup, ProcessGroup, Work};
pub use device::Device;
pub use dtype::DType;
pub use tensor::{Tensor, TensorError};
