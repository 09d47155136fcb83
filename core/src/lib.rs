pub mod config;
pub mod engine;
pub mod gateway;
pub mod observer;
pub mod runner;
pub mod scheduler;

/// Interfaces that platform shells can implement to adapt the core library
/// without pulling in platform-specific dependencies.
pub mod platform {
    use crate::runner::CommandOutput;

    /// Trait for dispatching user-visible notifications.
    pub trait Notifier {
        fn info(&self, title: &str, body: &str);
        fn error(&self, title: &str, body: &str);
    }

    /// Trait for platform-correct config paths.
    pub trait AppPaths {
        fn config_path(&self) -> std::path::PathBuf;
    }

    /// Trait for running an external program to completion.
    ///
    /// Implementations must not panic: launch failures are reported as a
    /// failed [`CommandOutput`] with the diagnostic in `stderr`.
    pub trait CommandRunner: Send + Sync {
        fn run(&self, program: &str, args: &[String]) -> CommandOutput;
    }
}
