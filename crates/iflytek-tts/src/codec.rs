//! Wire format of the streaming synthesis protocol.
//!
//! Outbound frames carry base64-encoded UTF-8 text; inbound frames carry
//! base64-encoded 16 kHz mono PCM16. Nothing in this module performs I/O.

use base64::{Engine, engine::general_purpose::STANDARD};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Sample rate of the PCM returned by the service.
pub const SAMPLE_RATE: u32 = 16_000;
/// Channel count of the PCM returned by the service.
pub const CHANNELS: u16 = 1;
/// Bits per sample of the PCM returned by the service.
pub const BIT_DEPTH: u16 = 16;

/// `header.status` value the service uses to mark the final audio frame.
const STREAM_FINISHED: u8 = 2;

/// Position of a text frame within a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(into = "u8")]
pub enum FrameStatus {
    /// First frame of a multi-frame turn.
    First,
    /// Any frame strictly between the first and the last.
    Middle,
    /// Final frame, or the only frame of a single-frame turn.
    Last,
}

impl FrameStatus {
    pub fn code(self) -> u8 {
        match self {
            FrameStatus::First => 0,
            FrameStatus::Middle => 1,
            FrameStatus::Last => 2,
        }
    }
}

impl From<FrameStatus> for u8 {
    fn from(status: FrameStatus) -> Self {
        status.code()
    }
}

fn default_voice() -> String {
    "x5_lingfeiyi_flow".to_string()
}

fn default_level() -> u32 {
    50
}

fn default_oral_level() -> String {
    "mid".to_string()
}

/// Voice settings negotiated for a turn.
///
/// Deserializes from the `parameters` object handed out by the session
/// service; fields it omits fall back to the service defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceParameters {
    #[serde(default = "default_voice")]
    pub voice: String,
    #[serde(default = "default_level")]
    pub speed: u32,
    #[serde(default = "default_level")]
    pub volume: u32,
    #[serde(default = "default_level")]
    pub pitch: u32,
    #[serde(default = "default_oral_level")]
    pub oral_level: String,
}

impl Default for VoiceParameters {
    fn default() -> Self {
        Self {
            voice: default_voice(),
            speed: default_level(),
            volume: default_level(),
            pitch: default_level(),
            oral_level: default_oral_level(),
        }
    }
}

/// A text frame ready to be serialized onto the connection.
#[derive(Debug, Clone, Serialize)]
pub struct OutboundFrame {
    pub header: OutboundHeader,
    pub payload: OutboundPayload,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameter: Option<ParameterBlock>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OutboundHeader {
    pub app_id: String,
    pub status: FrameStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct OutboundPayload {
    pub text: TextPayload,
}

#[derive(Debug, Clone, Serialize)]
pub struct TextPayload {
    pub encoding: &'static str,
    pub compress: &'static str,
    pub format: &'static str,
    pub status: FrameStatus,
    pub seq: u32,
    /// Base64 of the UTF-8 chunk.
    pub text: String,
    /// Characters in the chunk before encoding.
    #[serde(skip)]
    pub chars: usize,
}

/// Synthesis settings sent once, on the first frame of a turn.
#[derive(Debug, Clone, Serialize)]
pub struct ParameterBlock {
    pub oral: OralParameters,
    pub tts: SynthesisParameters,
}

#[derive(Debug, Clone, Serialize)]
pub struct OralParameters {
    pub oral_level: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SynthesisParameters {
    pub vcn: String,
    pub speed: u32,
    pub volume: u32,
    pub pitch: u32,
    pub audio: AudioFormat,
}

#[derive(Debug, Clone, Serialize)]
pub struct AudioFormat {
    pub encoding: &'static str,
    pub sample_rate: u32,
    pub channels: u16,
    pub bit_depth: u16,
}

impl AudioFormat {
    /// Raw little-endian PCM16, mono, 16 kHz.
    pub fn pcm16_mono() -> Self {
        Self {
            encoding: "raw",
            sample_rate: SAMPLE_RATE,
            channels: CHANNELS,
            bit_depth: BIT_DEPTH,
        }
    }
}

impl From<&VoiceParameters> for ParameterBlock {
    fn from(params: &VoiceParameters) -> Self {
        Self {
            oral: OralParameters {
                oral_level: params.oral_level.clone(),
            },
            tts: SynthesisParameters {
                vcn: params.voice.clone(),
                speed: params.speed,
                volume: params.volume,
                pitch: params.pitch,
                audio: AudioFormat::pcm16_mono(),
            },
        }
    }
}

impl OutboundFrame {
    pub fn seq(&self) -> u32 {
        self.payload.text.seq
    }

    pub fn status(&self) -> FrameStatus {
        self.header.status
    }

    pub fn has_parameters(&self) -> bool {
        self.parameter.is_some()
    }

    /// Length of the carried text in characters.
    pub fn text_chars(&self) -> usize {
        self.payload.text.chars
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Builds the frame for one text chunk.
///
/// `parameters` must be supplied for the first frame of a turn and only for
/// that frame; it becomes the frame's parameter block.
pub fn encode_text(
    app_id: &str,
    chunk: &str,
    seq: u32,
    status: FrameStatus,
    parameters: Option<&VoiceParameters>,
) -> OutboundFrame {
    OutboundFrame {
        header: OutboundHeader {
            app_id: app_id.to_string(),
            status,
        },
        payload: OutboundPayload {
            text: TextPayload {
                encoding: "utf8",
                compress: "raw",
                format: "plain",
                status,
                seq,
                text: STANDARD.encode(chunk.as_bytes()),
                chars: chunk.chars().count(),
            },
        },
        parameter: parameters.map(ParameterBlock::from),
    }
}

// --- Inbound ---

#[derive(Debug, Deserialize)]
struct InboundFrame {
    #[serde(default)]
    header: InboundHeader,
    #[serde(default)]
    payload: Option<InboundPayload>,
}

#[derive(Debug, Default, Deserialize)]
struct InboundHeader {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    status: Option<u8>,
}

#[derive(Debug, Deserialize)]
struct InboundPayload {
    #[serde(default)]
    audio: Option<AudioPayload>,
}

#[derive(Debug, Deserialize)]
struct AudioPayload {
    #[serde(default)]
    audio: Option<String>,
}

/// One thing the receive loop has to act on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    /// Raw PCM16 bytes, in arrival order.
    Audio(Bytes),
    /// The service rejected something; the stream itself continues.
    ServerError { code: i64, message: String },
    /// No more audio follows.
    EndOfStream,
    /// The message could not be understood.
    Unparseable { raw: String, reason: String },
}

/// Classifies one inbound text message.
///
/// A message carrying both audio and the finished status yields the audio
/// first and `EndOfStream` second. An error code suppresses everything else
/// in the message.
pub fn decode_inbound(raw: &str) -> Vec<InboundEvent> {
    let frame: InboundFrame = match serde_json::from_str(raw) {
        Ok(frame) => frame,
        Err(e) => {
            return vec![InboundEvent::Unparseable {
                raw: raw.to_string(),
                reason: e.to_string(),
            }];
        }
    };

    if frame.header.code != 0 {
        return vec![InboundEvent::ServerError {
            code: frame.header.code,
            message: frame.header.message.unwrap_or_default(),
        }];
    }

    let mut events = Vec::with_capacity(2);
    if let Some(encoded) = frame
        .payload
        .and_then(|payload| payload.audio)
        .and_then(|audio| audio.audio)
        .filter(|encoded| !encoded.is_empty())
    {
        match STANDARD.decode(encoded.as_bytes()) {
            Ok(pcm) => events.push(InboundEvent::Audio(Bytes::from(pcm))),
            Err(e) => events.push(InboundEvent::Unparseable {
                raw: raw.to_string(),
                reason: format!("invalid base64 audio: {e}"),
            }),
        }
    }
    if frame.header.status == Some(STREAM_FINISHED) {
        events.push(InboundEvent::EndOfStream);
    }
    events
}
