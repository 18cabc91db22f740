//! Terminal stream handle: the local-CLI implementation of the streaming
//! protocol. Tokens go straight to stdout; tool and thinking events are
//! single dim status lines on stderr.

use std::io::Write;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use autopoiesis_core::stream::StreamHandle;
use owo_colors::OwoColorize;

pub struct TerminalStreamHandle {
    with_ansi: bool,
    closed: AtomicBool,
}

impl TerminalStreamHandle {
    pub fn new(with_ansi: bool) -> Self {
        Self {
            with_ansi,
            closed: AtomicBool::new(false),
        }
    }

    fn status_line(&self, line: String) {
        if self.closed.load(Ordering::Relaxed) {
            return;
        }
        if self.with_ansi {
            eprintln!("{}", line.dimmed());
        } else {
            eprintln!("{line}");
        }
    }
}

impl StreamHandle for TerminalStreamHandle {
    fn write(&self, chunk: &str) {
        if self.closed.load(Ordering::Relaxed) {
            return;
        }
        print!("{chunk}");
        let _ = std::io::stdout().flush();
    }

    fn start_tool_call(&self, _tool_call_id: &str, name: &str, _details: Option<&str>) {
        self.status_line(format!("[tool] {name} ..."));
    }

    fn finish_tool_call(&self, _tool_call_id: &str, status: &str, _details: Option<&str>) {
        self.status_line(format!("[tool] {status}"));
    }

    fn start_thinking(&self) {
        self.status_line("[thinking]".to_string());
    }

    fn update_thinking(&self, _chunk: &str) {}

    fn finish_thinking(&self) {
        self.status_line("[thinking done]".to_string());
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::Relaxed) {
            return;
        }
        println!();
        let _ = std::io::stdout().flush();
    }
}
