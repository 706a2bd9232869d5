// Executor — evaluates ember IR against a runtime
//
//   Runtime       — memory, stream and communicator pools plus the dispatch
//                   registry and binding table an interpreter runs against
//   SymbolTable   — lexical scopes with drop guards
//   Interpreter   — one case per IR node kind, eight-step primitive dispatch
//
// USAGE:
//   let interp = Interpreter::new(Runtime::host());
//   let value = interp.interpret(&expr, Some(&module))?;
//
// or, through this thread's interpreter:
//   let value = ember::exec::interpret(&expr, Some(&module))?;

mod interpreter;
mod runtime;
mod symbol_table;

pub use interpreter::{interpret, invoke_closure, invoke_primitive, set_thread_runtime, Interpreter};
pub use runtime::{Runtime, RuntimeConfig};
pub use symbol_table::{AddVar, LocalFrame, SymbolTable};
