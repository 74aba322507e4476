pub mod chunk;
pub mod compiler;
pub mod error;
pub mod value;

pub use chunk::{Chunk, OpCode};
pub use compiler::compile;
pub use error::CompileError;
pub use value::{
    format_number, Access, BoundMethodObj, ClassObj, ClosureObj, FunctionKind, FunctionObj,
    InstanceObj, NativeFn, NativeObj, Object, UpvalueObj, Value,
};
