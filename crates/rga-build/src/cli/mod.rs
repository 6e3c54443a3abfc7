pub mod command;
pub mod invoker;
pub mod kernel_list;

pub use command::{CommandLine, CommandLineBuilder, build_header};
pub use invoker::{Invocation, ProcessInvoker, SystemInvoker};
