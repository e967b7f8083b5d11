use std::io::{self, Write};

use mailkeep_sync::ProgressSink;

/// Progress counter rendered on stderr so it never mixes with piped
/// output from the log writer's perspective.
#[derive(Default)]
pub struct TerminalProgress {
    mailbox: String,
    total: usize,
    done: usize,
    active: bool,
}

impl TerminalProgress {
    pub fn new() -> Self {
        Self::default()
    }

    fn render(&self) {
        let mut stderr = io::stderr();
        let _ = write!(
            stderr,
            "\r{:<30} {}/{} msgs",
            self.mailbox, self.done, self.total
        );
        let _ = stderr.flush();
    }
}

impl ProgressSink for TerminalProgress {
    fn start(&mut self, mailbox: &str, total: usize) {
        self.mailbox = mailbox.to_string();
        self.total = total;
        self.done = 0;
        self.active = true;
        self.render();
    }

    fn inc(&mut self, count: usize) {
        self.done += count;
        self.render();
    }

    fn finish(&mut self) {
        if self.active {
            let _ = writeln!(io::stderr());
            self.active = false;
        }
    }
}
