use serde::{Deserialize, Serialize};

use crate::puzzle::Group;
use crate::session::MAX_MISTAKES;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Success,
    Warning,
    Error,
}

/// The view side of a [`GameSession`](crate::GameSession).
///
/// The session calls these after every transition and never reads view state back.
pub trait Renderer {
    fn render_grid(&mut self, expressions: &[String]);
    fn render_found_group(&mut self, group: &Group);
    fn render_message(&mut self, text: &str, severity: Severity);
    fn render_mistake_counter(&mut self, remaining: u8);
    /// Shown while a database switch is pending.
    fn render_loading(&mut self, _loading: bool) {}
}

/// One renderer call, captured for replay by a remote view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RenderEvent {
    Grid { expressions: Vec<String> },
    FoundGroup { group: Group },
    Message { text: String, severity: Severity },
    MistakeCounter { remaining: u8, visual: String },
    Loading { loading: bool },
}

#[derive(Debug, Default)]
pub struct RecordingRenderer {
    events: Vec<RenderEvent>,
}

impl RecordingRenderer {
    pub fn events(&self) -> &[RenderEvent] {
        &self.events
    }

    pub fn take(&mut self) -> Vec<RenderEvent> {
        std::mem::take(&mut self.events)
    }
}

impl Renderer for RecordingRenderer {
    fn render_grid(&mut self, expressions: &[String]) {
        self.events.push(RenderEvent::Grid {
            expressions: expressions.to_vec(),
        });
    }

    fn render_found_group(&mut self, group: &Group) {
        self.events.push(RenderEvent::FoundGroup {
            group: group.clone(),
        });
    }

    fn render_message(&mut self, text: &str, severity: Severity) {
        self.events.push(RenderEvent::Message {
            text: text.to_string(),
            severity,
        });
    }

    fn render_mistake_counter(&mut self, remaining: u8) {
        self.events.push(RenderEvent::MistakeCounter {
            remaining,
            visual: mistake_visual(remaining),
        });
    }

    fn render_loading(&mut self, loading: bool) {
        self.events.push(RenderEvent::Loading { loading });
    }
}

/// Discards every call.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullRenderer;

impl Renderer for NullRenderer {
    fn render_grid(&mut self, _expressions: &[String]) {}
    fn render_found_group(&mut self, _group: &Group) {}
    fn render_message(&mut self, _text: &str, _severity: Severity) {}
    fn render_mistake_counter(&mut self, _remaining: u8) {}
}

/// `✕` per mistake made followed by `○` per mistake left.
pub fn mistake_visual(remaining: u8) -> String {
    let remaining = remaining.min(MAX_MISTAKES);
    let made = MAX_MISTAKES - remaining;
    format!(
        "{}{}",
        "✕".repeat(made as usize),
        "○".repeat(remaining as usize)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mistake_visual_counts() {
        assert_eq!(mistake_visual(4), "○○○○");
        assert_eq!(mistake_visual(1), "✕✕✕○");
        assert_eq!(mistake_visual(0), "✕✕✕✕");
    }

    #[test]
    fn recording_renderer_drains() {
        let mut renderer = RecordingRenderer::default();
        renderer.render_message("hi", Severity::Info);
        renderer.render_loading(true);
        assert_eq!(renderer.events().len(), 2);
        let events = renderer.take();
        assert_eq!(events.len(), 2);
        assert!(renderer.events().is_empty());
        let json = serde_json::to_value(&events[0]).unwrap();
        assert_eq!(json["kind"], "message");
        assert_eq!(json["severity"], "info");
    }
}
