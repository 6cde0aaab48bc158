/// Console, combined.log and error.log sinks built on `tracing`.
pub mod loggerlocal;
