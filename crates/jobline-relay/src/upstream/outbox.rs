use std::collections::VecDeque;

use serde_json::json;

#[derive(Clone, Debug, PartialEq, Eq)]
struct Frame {
    text: String,
    audio: bool,
}

/// Frames waiting to go upstream, in order.
///
/// Audio appends are bounded: when the queue already holds `audio_capacity`
/// appends the oldest one is dropped. Control frames are never dropped.
#[derive(Debug)]
pub struct Outbox {
    frames: VecDeque<Frame>,
    audio_queued: usize,
    audio_capacity: usize,
    dropped: u64,
}

impl Outbox {
    pub fn new(audio_capacity: usize) -> Self {
        Self {
            frames: VecDeque::new(),
            audio_queued: 0,
            audio_capacity: audio_capacity.max(1),
            dropped: 0,
        }
    }

    /// Queue an `input_audio_buffer.append` carrying `audio` (base64).
    pub fn push_audio(&mut self, audio: &str) {
        if self.audio_queued >= self.audio_capacity {
            if let Some(pos) = self.frames.iter().position(|f| f.audio) {
                let _ = self.frames.remove(pos);
                self.audio_queued -= 1;
                self.dropped += 1;
            }
        }
        self.frames.push_back(Frame {
            text: json!({ "type": "input_audio_buffer.append", "audio": audio }).to_string(),
            audio: true,
        });
        self.audio_queued += 1;
    }

    pub fn push_control(&mut self, text: String) {
        self.frames.push_back(Frame { text, audio: false });
    }

    /// Drop every unsent append, then queue `input_audio_buffer.clear`.
    /// Returns how many appends were discarded.
    pub fn clear_audio(&mut self) -> usize {
        let before = self.frames.len();
        self.frames.retain(|f| !f.audio);
        let removed = before - self.frames.len();
        self.audio_queued = 0;
        self.push_control(json!({ "type": "input_audio_buffer.clear" }).to_string());
        removed
    }

    pub fn pop(&mut self) -> Option<String> {
        let frame = self.frames.pop_front()?;
        if frame.audio {
            self.audio_queued -= 1;
        }
        Some(frame.text)
    }

    /// Forget everything queued.
    pub fn clear(&mut self) {
        self.frames.clear();
        self.audio_queued = 0;
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Appends dropped because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}
