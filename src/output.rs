/// Abstraction over user-facing output.
///
/// Command modules print through this trait instead of calling `println!`
/// directly.
pub trait UserOutput: Send + Sync {
    /// Informational line on stdout.
    fn status(&self, message: &str);

    /// Warning on stderr.
    fn warning(&self, message: &str);

    /// Error on stderr.
    fn error(&self, message: &str);

    /// A blank line separator.
    fn blank(&self);
}

/// Standard CLI output: stdout for results, stderr for problems.
pub struct CliOutput;

impl UserOutput for CliOutput {
    fn status(&self, message: &str) {
        println!("{}", message);
    }

    fn warning(&self, message: &str) {
        eprintln!("\x1b[33m{}\x1b[0m", message);
    }

    fn error(&self, message: &str) {
        eprintln!("\x1b[31m{}\x1b[0m", message);
    }

    fn blank(&self) {
        println!();
    }
}
