//! Type-safe host command contracts.
//!
//! Host tools are never invoked with ad-hoc string vectors. Each invocation is
//! a struct implementing [`HostCommand`], so flag spelling lives in one place
//! and the runner can tell read-only queries apart from mutations.
//!
//! # Contract
//!
//! - `program()` is the executable name resolved through `PATH`.
//! - `to_cli_args()` returns the arguments exactly as the tool expects them.
//! - `is_mutating()` is `false` only for commands that never change host state.
//!   Dry-run executes those and skips everything else.

/// A typed invocation of a host binary
pub trait HostCommand {
    /// Executable name (e.g., `"mkfs.xfs"`)
    fn program(&self) -> &'static str;

    /// Arguments in the order the tool expects
    fn to_cli_args(&self) -> Vec<String>;

    /// Extra environment variables for the child
    fn get_env_vars(&self) -> Vec<(String, String)> {
        Vec::new()
    }

    /// Whether running this command changes host state
    fn is_mutating(&self) -> bool;

    /// Shell-like rendering for logs and dry-run output
    fn describe(&self) -> String {
        let args = self.to_cli_args();
        if args.is_empty() {
            self.program().to_string()
        } else {
            format!("{} {}", self.program(), args.join(" "))
        }
    }
}
