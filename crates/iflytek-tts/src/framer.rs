//! Turns a sequence of text fragments into sequenced protocol frames.

use crate::codec::{FrameStatus, OutboundFrame, VoiceParameters, encode_text};

/// Stateful framer for a single turn.
///
/// Holds back one non-blank fragment so it knows whether that fragment is the
/// last one. Blank fragments are dropped before they can take a sequence
/// number, so a turn always ends with exactly one [`FrameStatus::Last`] frame
/// (or with no frames at all).
#[derive(Debug)]
pub struct TextFramer {
    app_id: String,
    parameters: VoiceParameters,
    next_seq: u32,
    pending: Option<String>,
    spoken: String,
}

impl TextFramer {
    pub fn new(app_id: impl Into<String>, parameters: VoiceParameters) -> Self {
        Self {
            app_id: app_id.into(),
            parameters,
            next_seq: 0,
            pending: None,
            spoken: String::new(),
        }
    }

    /// Feeds one fragment.
    ///
    /// Returns the frame for the previously held fragment once this one proves
    /// it was not the last.
    pub fn push(&mut self, fragment: &str) -> Option<OutboundFrame> {
        let chunk = fragment.trim();
        if chunk.is_empty() {
            return None;
        }
        self.spoken.push_str(fragment);
        let previous = self.pending.replace(chunk.to_string());
        previous.map(|held| self.emit(&held, false))
    }

    /// Flushes the held fragment as the final frame.
    pub fn finish(&mut self) -> Option<OutboundFrame> {
        let held = self.pending.take()?;
        Some(self.emit(&held, true))
    }

    fn emit(&mut self, chunk: &str, is_last: bool) -> OutboundFrame {
        let is_first = self.next_seq == 0;
        let status = match (is_first, is_last) {
            (_, true) => FrameStatus::Last,
            (true, false) => FrameStatus::First,
            (false, false) => FrameStatus::Middle,
        };
        let parameters = is_first.then_some(&self.parameters);
        let frame = encode_text(&self.app_id, chunk, self.next_seq, status, parameters);
        self.next_seq += 1;
        frame
    }

    /// Number of frames handed out so far.
    pub fn frames_emitted(&self) -> u32 {
        self.next_seq
    }

    /// Text of every non-blank fragment seen, as received, trimmed at the ends.
    pub fn spoken_text(&self) -> &str {
        self.spoken.trim()
    }
}

/// Frames a complete, already-available fragment sequence.
pub fn frame_all<I, S>(app_id: &str, parameters: VoiceParameters, fragments: I) -> Vec<OutboundFrame>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut framer = TextFramer::new(app_id, parameters);
    let mut frames: Vec<OutboundFrame> = fragments
        .into_iter()
        .filter_map(|fragment| framer.push(fragment.as_ref()))
        .collect();
    frames.extend(framer.finish());
    frames
}
