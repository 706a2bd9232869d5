// Reference operators — host implementations of a small operator set
//
// Each operator comes with the full contract the interpreter and the passes
// consume: a schema, a declare step, exactly one type rule and a host
// `OpEnv`. Kernels are written for clarity, element-wise loops use rayon.
//
//   relu(x)                 unary, identity-typed
//   add(x1, x2)             broadcasting binary
//   add_inplace(x1, x2)     x1 += x2, output shares x1's storage
//   sum(x)                  full reduction, uses a workspace
//   split(x, sections)      tuple output along axis 0
//   shape(x)                computed at declare time, never dispatched
//   stream_sync(x, tag)     waits on a stream, output is x
//   all_reduce(x)           uses a communicator
//
// `registry()` holds the definitions; `install` registers the host
// implementations into a dispatch registry.

mod args;
mod binary;
mod collective;
mod reduce;
mod transform;
mod unary;

use std::sync::OnceLock;

use ember_core::op::{DispatchRegistry, Op, OpRegistry};
use ember_core::Result;

pub use args::{BinaryArgs, SplitArgs, StreamArgs, UnaryArgs};

/// Priority of the host implementations in the dispatch registry.
pub const HOST_PRIORITY: i32 = 10;

/// All reference operator definitions.
pub fn registry() -> &'static OpRegistry {
    static REGISTRY: OnceLock<OpRegistry> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        let reg = OpRegistry::new();
        reg.register(unary::relu_def());
        reg.register(binary::add_def());
        reg.register(binary::add_inplace_def());
        reg.register(reduce::sum_def());
        reg.register(transform::split_def());
        reg.register(transform::shape_def());
        reg.register(collective::stream_sync_def());
        reg.register(collective::all_reduce_def());
        reg
    })
}

/// Look a reference operator up by name.
pub fn get(name: &str) -> Result<Op> {
    registry().get(name)
}

/// Register every host implementation.
pub fn install(dispatch: &DispatchRegistry) {
    unary::install(dispatch);
    binary::install(dispatch);
    reduce::install(dispatch);
    transform::install(dispatch);
    collective::install(dispatch);
}
