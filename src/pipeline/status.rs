//! Incremental status rendering.
//!
//! The executor prints a handful of "temporary" lines after every iteration
//! (in-flight group progress, the active job) and rewrites them on the next
//! one. Rewriting uses plain ANSI cursor movement and is disabled when the
//! output is not a terminal, in which case only permanent lines are printed.

use std::io::Write;

/// Move the cursor one line up and clear it.
const CLEAR_LINE_UP: &str = "\x1b[1A\x1b[2K";

/// Renders executor progress to stdout/stderr.
///
/// Whether ANSI rewriting is used is an explicit construction-time choice;
/// there is no process-wide toggle.
#[derive(Debug)]
pub struct StatusRenderer {
    ansi: bool,
    tmp_lines: usize,
}

impl StatusRenderer {
    pub fn new(ansi: bool) -> Self {
        StatusRenderer { ansi, tmp_lines: 0 }
    }

    /// Erases the temporary lines printed since the last clear.
    pub fn clear_tmp(&mut self) {
        if self.ansi {
            for _ in 0..self.tmp_lines {
                print!("{CLEAR_LINE_UP}");
            }
            let _ = std::io::stdout().flush();
        }
        self.tmp_lines = 0;
    }

    /// Prints a line that will be rewritten on the next iteration.
    /// Skipped entirely in non-ANSI mode to keep logs readable.
    pub fn print_tmp(&mut self, message: &str) {
        if !self.ansi {
            return;
        }
        self.tmp_lines += message.matches('\n').count() + 1;
        println!("{message}");
    }

    /// Prints a permanent line.
    pub fn print(&self, message: &str) {
        println!("{message}");
    }

    /// Prints a permanent line to the error stream.
    pub fn error(&self, message: &str) {
        eprintln!("{message}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tmp_line_accounting() {
        let mut renderer = StatusRenderer::new(true);
        renderer.print_tmp("one line");
        renderer.print_tmp("two\nlines");
        assert_eq!(renderer.tmp_lines, 3);
        renderer.clear_tmp();
        assert_eq!(renderer.tmp_lines, 0);
    }

    #[test]
    fn test_non_ansi_skips_tmp_lines() {
        let mut renderer = StatusRenderer::new(false);
        renderer.print_tmp("invisible");
        assert_eq!(renderer.tmp_lines, 0);
    }
}
