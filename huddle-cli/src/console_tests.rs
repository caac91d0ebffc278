//! Tests for console commands and rendering

#[cfg(test)]
mod tests {
    use super::super::console::*;
    use huddle_core::{
        decode_frame, CallEvent, CallId, CallMode, CallStatus, ClearReason, ConversationEvent,
        EndReason, TrackKind,
    };

    #[test]
    fn test_parse_commands() {
        assert_eq!(ConsoleCommand::parse("call"), Ok(ConsoleCommand::Call(CallMode::Video)));
        assert_eq!(
            ConsoleCommand::parse("  c audio "),
            Ok(ConsoleCommand::Call(CallMode::Audio))
        );
        assert_eq!(ConsoleCommand::parse("ACCEPT"), Ok(ConsoleCommand::Accept));
        assert_eq!(ConsoleCommand::parse("h"), Ok(ConsoleCommand::Hangup));
        assert_eq!(ConsoleCommand::parse("q"), Ok(ConsoleCommand::Quit));
    }

    #[test]
    fn test_parse_rejects_unknown_input() {
        assert!(ConsoleCommand::parse("").is_err());
        assert!(ConsoleCommand::parse("dance").is_err());
        assert!(ConsoleCommand::parse("call hologram").is_err());
    }

    #[test]
    fn test_describe_incoming_call() {
        let ringing = ConversationEvent::IncomingCall {
            from: Some("alice".to_string()),
            mode: CallMode::Video,
            ready: true,
        };
        let line = describe(&ringing).unwrap();
        assert!(line.contains("alice"));
        assert!(line.contains("accept"));

        let cleared = ConversationEvent::IncomingCallCleared {
            from: None,
            reason: ClearReason::Expired,
        };
        assert_eq!(describe(&cleared).unwrap(), "missed call from someone");
    }

    #[test]
    fn test_describe_call_events() {
        let call_id = CallId::new();
        let ended = ConversationEvent::Call(CallEvent::CallEnded {
            call_id,
            reason: EndReason::RemoteHangup,
            duration_ms: Some(65_000),
        });
        assert_eq!(describe(&ended).unwrap(), "call ended (remote hangup) after 65s");

        let status = ConversationEvent::Call(CallEvent::StatusChanged {
            call_id: Some(call_id),
            old: CallStatus::Calling,
            new: CallStatus::Active,
        });
        assert_eq!(describe(&status).unwrap(), "call status: active");

        let track = ConversationEvent::Call(CallEvent::RemoteTrackAdded {
            call_id,
            track_id: "t1".to_string(),
            kind: TrackKind::Video,
        });
        assert!(describe(&track).unwrap().contains("t1"));

        let noise = ConversationEvent::Call(CallEvent::LocalCandidateSent { call_id });
        assert!(describe(&noise).is_none());
    }

    #[test]
    fn test_describe_chat() {
        let chat = ConversationEvent::Chat(serde_json::json!({"message": "hi", "sender": "bob"}));
        assert_eq!(describe(&chat).unwrap(), "[bob] hi");

        let typing = ConversationEvent::Chat(serde_json::json!({"type": "typing"}));
        assert!(describe(&typing).is_none());
    }

    #[test]
    fn test_classify_frames() {
        let frame = decode_frame(r#"{"type":"call_end"}"#).unwrap();
        assert_eq!(classify(&frame), "call signaling: call_end");

        let frame = decode_frame(r#"{"error":"bad"}"#).unwrap();
        assert_eq!(classify(&frame), "relay error: bad");

        let frame = decode_frame(r#"{"message":"hello"}"#).unwrap();
        assert_eq!(classify(&frame), "chat traffic");
    }

    #[test]
    fn test_random_user_name_shape() {
        let name = random_user_name();
        let (word, number) = name.split_once('-').unwrap();
        assert!(!word.is_empty());
        assert_eq!(number.len(), 4);
        assert!(number.chars().all(|c| c.is_ascii_digit()));
    }
}
