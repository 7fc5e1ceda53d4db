mod build_tool;
mod maven_invoker;
mod process;

pub use build_tool::{BuildInvocationResult, BuildTool, InvocationRequest};
pub use maven_invoker::{MavenInvoker, TRIMMED_MARKER, USER_ID_ENV};
pub use process::ProcessTracker;
