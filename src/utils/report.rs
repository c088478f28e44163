//! Human-readable progress output.
//!
//! Every line printed to the console is mirrored as a tracing event so the
//! operational log carries the same story without the glyphs.

use tracing::{error, info, warn};

/// Console reporter. The indentation level lives here rather than in any
/// global state; `step` resets it for each pipeline stage.
#[derive(Debug, Default)]
pub struct Reporter {
    indent: usize,
}

impl Reporter {
    pub fn new() -> Self {
        Self::default()
    }

    fn pad(&self) -> String {
        "  ".repeat(self.indent)
    }

    /// Starts a new pipeline stage; following lines are indented beneath it.
    pub fn step(&mut self, title: &str) {
        self.indent = 0;
        println!("\n▶ {}", title);
        info!(stage = title, "stage started");
        self.indent = 1;
    }

    pub fn nest(&mut self) {
        self.indent += 1;
    }

    pub fn unnest(&mut self) {
        self.indent = self.indent.saturating_sub(1);
    }

    pub fn info(&self, msg: impl AsRef<str>) {
        let msg = msg.as_ref();
        println!("{}{}", self.pad(), msg);
        info!("{}", msg);
    }

    pub fn success(&self, msg: impl AsRef<str>) {
        let msg = msg.as_ref();
        println!("{}✓ {}", self.pad(), msg);
        info!("{}", msg);
    }

    pub fn warn(&self, msg: impl AsRef<str>) {
        let msg = msg.as_ref();
        eprintln!("{}⚠️ {}", self.pad(), msg);
        warn!("{}", msg);
    }

    pub fn error(&self, msg: impl AsRef<str>) {
        let msg = msg.as_ref();
        eprintln!("{}❌ {}", self.pad(), msg);
        error!("{}", msg);
    }

    /// Final status line; always printed flush left.
    pub fn finish(&mut self, success: bool, msg: impl AsRef<str>) {
        self.indent = 0;
        let msg = msg.as_ref();
        if success {
            println!("\n🎉 {}", msg);
            info!(success, "{}", msg);
        } else {
            eprintln!("\n❌ {}", msg);
            error!(success, "{}", msg);
        }
    }

    #[cfg(test)]
    pub(crate) fn depth(&self) -> usize {
        self.indent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_indentation_is_per_reporter() {
        let mut first = Reporter::new();
        let second = Reporter::new();
        first.step("Archive");
        first.nest();
        assert_eq!(first.depth(), 2);
        assert_eq!(second.depth(), 0);
        first.unnest();
        first.unnest();
        first.unnest();
        assert_eq!(first.depth(), 0);
        first.step("Transfer");
        assert_eq!(first.depth(), 1);
    }
}
