//! The data-model registry: installed objects, their capability set, and the
//! iteration/presence queries every other subsystem is built on.

pub mod execute;
pub mod object;
pub mod registry;
pub mod testing;

pub use execute::{parse_execute_args, ExecArg};
pub use object::{ObjectHandler, ResourceDef, ResourceKind, ResourcePresence, SharedObject};
pub use registry::Registry;
