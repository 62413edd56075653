//! The parts of the VM the method compiler talks to: the method model,
//! the verifier, heap handles and invocation dispatch.

pub mod bytecode;
pub mod dispatch;
pub mod heap;
pub mod policy;
pub mod verifier;

pub use bytecode::{BasicType, Bytecode, Constant, Method};
pub use dispatch::{Dispatcher, Invocation};
pub use heap::ObjectRef;
pub use policy::{Decision, JitPolicy, MethodState};
