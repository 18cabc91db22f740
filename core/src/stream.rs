//! Stream handles attached to a turn: incremental text, tool-call
//! begin/end, and thinking events, delivered best-effort.
//!
//! Delivery failures mark the failing handle closed and never propagate:
//! a dead observer cannot block the turn or its other subscribers.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use autopoiesis_protocol::StreamEvent;
use tokio::sync::mpsc;
use tracing::warn;

pub trait StreamHandle: Send + Sync {
    fn write(&self, chunk: &str);
    fn start_tool_call(&self, tool_call_id: &str, name: &str, details: Option<&str>);
    fn finish_tool_call(&self, tool_call_id: &str, status: &str, details: Option<&str>);
    fn start_thinking(&self);
    fn update_thinking(&self, chunk: &str);
    fn finish_thinking(&self);
    fn close(&self);
}

/// Batch-mode handle: swallows everything.
#[derive(Default)]
pub struct NullStreamHandle;

impl StreamHandle for NullStreamHandle {
    fn write(&self, _chunk: &str) {}
    fn start_tool_call(&self, _tool_call_id: &str, _name: &str, _details: Option<&str>) {}
    fn finish_tool_call(&self, _tool_call_id: &str, _status: &str, _details: Option<&str>) {}
    fn start_thinking(&self) {}
    fn update_thinking(&self, _chunk: &str) {}
    fn finish_thinking(&self) {}
    fn close(&self) {}
}

/// Serialises events into a channel; the consuming end is whatever server
/// transport (WebSocket, SSE) is attached. Send failures mark the handle
/// dead so subsequent calls become no-ops.
pub struct ChannelStreamHandle {
    tx: mpsc::UnboundedSender<StreamEvent>,
    closed: AtomicBool,
}

impl ChannelStreamHandle {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<StreamEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                closed: AtomicBool::new(false),
            },
            rx,
        )
    }

    fn send(&self, event: StreamEvent) {
        if self.closed.load(Ordering::Relaxed) {
            return;
        }
        if self.tx.send(event).is_err() {
            warn!("stream subscriber went away; closing handle");
            self.closed.store(true, Ordering::Relaxed);
        }
    }
}

impl StreamHandle for ChannelStreamHandle {
    fn write(&self, chunk: &str) {
        self.send(StreamEvent::Token {
            content: chunk.to_string(),
        });
    }

    fn start_tool_call(&self, tool_call_id: &str, name: &str, details: Option<&str>) {
        self.send(StreamEvent::ToolCall {
            tool_call_id: tool_call_id.to_string(),
            name: name.to_string(),
            details: details.map(str::to_string),
        });
    }

    fn finish_tool_call(&self, tool_call_id: &str, status: &str, details: Option<&str>) {
        self.send(StreamEvent::ToolResult {
            tool_call_id: tool_call_id.to_string(),
            status: status.to_string(),
            details: details.map(str::to_string),
        });
    }

    fn start_thinking(&self) {
        self.send(StreamEvent::ThinkingStart {});
    }

    fn update_thinking(&self, chunk: &str) {
        self.send(StreamEvent::Thinking {
            content: chunk.to_string(),
        });
    }

    fn finish_thinking(&self) {
        self.send(StreamEvent::ThinkingDone {});
    }

    fn close(&self) {
        self.send(StreamEvent::Done {});
        self.closed.store(true, Ordering::Relaxed);
    }
}

/// Fans every event out to multiple handles. One subscriber failing (or
/// closing) does not stop delivery to the rest.
pub struct TeeStreamHandle {
    handles: Vec<Arc<dyn StreamHandle>>,
}

impl TeeStreamHandle {
    pub fn new(handles: Vec<Arc<dyn StreamHandle>>) -> Self {
        Self { handles }
    }
}

impl StreamHandle for TeeStreamHandle {
    fn write(&self, chunk: &str) {
        for handle in &self.handles {
            handle.write(chunk);
        }
    }

    fn start_tool_call(&self, tool_call_id: &str, name: &str, details: Option<&str>) {
        for handle in &self.handles {
            handle.start_tool_call(tool_call_id, name, details);
        }
    }

    fn finish_tool_call(&self, tool_call_id: &str, status: &str, details: Option<&str>) {
        for handle in &self.handles {
            handle.finish_tool_call(tool_call_id, status, details);
        }
    }

    fn start_thinking(&self) {
        for handle in &self.handles {
            handle.start_thinking();
        }
    }

    fn update_thinking(&self, chunk: &str) {
        for handle in &self.handles {
            handle.update_thinking(chunk);
        }
    }

    fn finish_thinking(&self) {
        for handle in &self.handles {
            handle.finish_thinking();
        }
    }

    fn close(&self) {
        for handle in &self.handles {
            handle.close();
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn channel_handle_forwards_events_in_order() {
        let (handle, mut rx) = ChannelStreamHandle::new();
        handle.write("hel");
        handle.start_tool_call("c1", "shell", None);
        handle.finish_tool_call("c1", "completed", Some("ok"));
        handle.close();

        assert!(matches!(
            rx.try_recv().unwrap(),
            StreamEvent::Token { content } if content == "hel"
        ));
        assert!(matches!(rx.try_recv().unwrap(), StreamEvent::ToolCall { .. }));
        assert!(matches!(
            rx.try_recv().unwrap(),
            StreamEvent::ToolResult { .. }
        ));
        assert!(matches!(rx.try_recv().unwrap(), StreamEvent::Done {}));
    }

    #[test]
    fn dead_subscriber_does_not_panic() {
        let (handle, rx) = ChannelStreamHandle::new();
        drop(rx);
        handle.write("into the void");
        handle.close();
    }

    #[test]
    fn tee_keeps_delivering_past_a_dead_handle() {
        let (dead, dead_rx) = ChannelStreamHandle::new();
        drop(dead_rx);
        let (live, mut live_rx) = ChannelStreamHandle::new();
        let tee = TeeStreamHandle::new(vec![Arc::new(dead), Arc::new(live)]);

        tee.write("chunk");
        assert!(matches!(
            live_rx.try_recv().unwrap(),
            StreamEvent::Token { .. }
        ));
    }
}
