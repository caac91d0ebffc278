//! Console rendering and commands for an attached conversation

use huddle_core::{CallEvent, CallMode, ClearReason, ConversationEvent, InboundFrame};
use rand::Rng;

/// Command typed at the conversation prompt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleCommand {
    /// Start a call
    Call(CallMode),
    /// Accept the ringing call
    Accept,
    /// Decline the ringing call
    Decline,
    /// Hang up
    Hangup,
    /// Flip the microphone
    Mute,
    /// Flip the camera
    Video,
    /// Print the call snapshot
    Status,
    /// Print the command list
    Help,
    /// Leave the conversation
    Quit,
}

/// Prompt help text
pub const HELP: &str = "\
commands:
  call [audio|video]  start a call (default: video)
  accept | decline    answer the ringing call
  hangup              end the call
  mute | video        toggle microphone / camera
  status              show the call snapshot
  quit                leave the conversation";

impl ConsoleCommand {
    /// Parse one input line
    pub fn parse(line: &str) -> Result<Self, String> {
        let mut words = line.split_whitespace();
        let Some(verb) = words.next() else {
            return Err("empty command, type `help`".to_string());
        };
        let command = match verb.to_ascii_lowercase().as_str() {
            "call" | "c" => match words.next() {
                None | Some("video") => Self::Call(CallMode::Video),
                Some("audio") => Self::Call(CallMode::Audio),
                Some(other) => return Err(format!("unknown call type: {other}")),
            },
            "accept" | "a" => Self::Accept,
            "decline" | "d" => Self::Decline,
            "hangup" | "end" | "h" => Self::Hangup,
            "mute" | "m" => Self::Mute,
            "video" | "v" => Self::Video,
            "status" | "s" => Self::Status,
            "help" | "?" => Self::Help,
            "quit" | "exit" | "q" => Self::Quit,
            other => return Err(format!("unknown command: {other}, type `help`")),
        };
        Ok(command)
    }
}

fn on_off(enabled: bool) -> &'static str {
    if enabled {
        "on"
    } else {
        "off"
    }
}

/// One line for an event worth showing; `None` for chatter
pub fn describe(event: &ConversationEvent) -> Option<String> {
    let line = match event {
        ConversationEvent::Call(event) => return describe_call(event),
        ConversationEvent::IncomingCall { from, mode, ready } => {
            let caller = from.as_deref().unwrap_or("someone");
            if *ready {
                format!("📞 {caller} is calling ({mode}), `accept` or `decline`")
            } else {
                format!("📞 {caller} is calling ({mode}), waiting for the offer")
            }
        }
        ConversationEvent::IncomingCallCleared { from, reason } => {
            let caller = from.as_deref().unwrap_or("someone");
            match reason {
                ClearReason::Accepted => return None,
                ClearReason::Declined => format!("declined call from {caller}"),
                ClearReason::CallerHungUp => format!("{caller} hung up"),
                ClearReason::Expired => format!("missed call from {caller}"),
                ClearReason::Superseded => format!("dropped call from {caller}"),
                ClearReason::ChannelClosed => format!("call from {caller} lost with the connection"),
            }
        }
        ConversationEvent::Chat(value) => match value.get("message").and_then(|m| m.as_str()) {
            Some(message) => {
                let sender = value
                    .get("sender")
                    .or_else(|| value.get("user"))
                    .and_then(|s| s.as_str())
                    .unwrap_or("?");
                format!("[{sender}] {message}")
            }
            None => return None,
        },
        ConversationEvent::RelayError(error) => format!("⚠️  server rejected a frame: {error}"),
        ConversationEvent::ChannelClosed => "connection closed".to_string(),
    };
    Some(line)
}

fn describe_call(event: &CallEvent) -> Option<String> {
    let line = match event {
        CallEvent::StatusChanged { new, .. } => format!("call status: {new}"),
        CallEvent::MediaAccessFailed { mode, error } => {
            format!("❌ cannot start {mode} call: {error}")
        }
        CallEvent::RemoteTrackAdded { kind, track_id, .. } => {
            format!("receiving {kind} ({track_id})")
        }
        CallEvent::MediaToggled {
            audio_enabled,
            video_enabled,
            ..
        } => format!(
            "microphone {}, camera {}",
            on_off(*audio_enabled),
            on_off(*video_enabled)
        ),
        CallEvent::CallEnded {
            reason,
            duration_ms,
            ..
        } => match duration_ms {
            Some(ms) => format!("call ended ({reason}) after {}s", ms / 1000),
            None => format!("call ended ({reason})"),
        },
        CallEvent::LocalCandidateSent { .. } => return None,
    };
    Some(line)
}

/// Summary of a decoded frame
pub fn classify(frame: &InboundFrame) -> String {
    match frame {
        InboundFrame::Signaling(message) => {
            format!("call signaling: {}", message.message_type())
        }
        InboundFrame::MalformedSignaling {
            message_type,
            error,
        } => format!("malformed {message_type}: {error}"),
        InboundFrame::RelayError(error) => format!("relay error: {error}"),
        InboundFrame::Chat(_) => "chat traffic".to_string(),
    }
}

/// Throwaway user name such as `comet-4821`
pub fn random_user_name() -> String {
    const WORDS: &[&str] = &[
        "atlas", "beacon", "comet", "dragon", "eagle", "falcon", "galaxy", "harbor", "icarus",
        "jupiter", "knight", "lunar", "meteor", "nebula", "orbit", "phoenix", "quasar", "rocket",
        "stellar", "titan", "vortex",
    ];
    let mut rng = rand::thread_rng();
    let word = WORDS[rng.gen_range(0..WORDS.len())];
    format!("{}-{}", word, rng.gen_range(1000..10000))
}
