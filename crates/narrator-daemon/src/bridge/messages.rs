use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    service::{HealthReport, NarrationRequest, VoicesReport},
    tts::Engine,
};

fn new_request_id() -> String {
    Uuid::new_v4().to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Ping {
        #[serde(default)]
        nonce: Option<String>,
    },
    Health,
    Voices,
    RecommendedEngine,
    /// Answered with a `package` message followed by one binary frame holding the zip.
    Synthesize {
        #[serde(default = "new_request_id")]
        request_id: String,
        request: NarrationRequest,
    },
    /// Answered with `stream_start`, binary audio frames, then `stream_end`.
    Stream {
        #[serde(default = "new_request_id")]
        request_id: String,
        request: NarrationRequest,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DaemonMessage {
    Hello {
        version: String,
        capabilities: Vec<String>,
        engines: Vec<Engine>,
        recommended_engine: Engine,
    },
    Pong {
        nonce: Option<String>,
    },
    Health(HealthReport),
    Voices(VoicesReport),
    RecommendedEngine {
        recommended_engine: Engine,
    },
    Package {
        request_id: String,
        file_name: String,
        content_type: String,
        size: usize,
        cached: bool,
    },
    StreamStart {
        request_id: String,
        content_type: String,
        sample_rate: u32,
        headers: BTreeMap<String, String>,
    },
    StreamEnd {
        request_id: String,
        bytes: u64,
        /// Set when the stream was cut short.
        error: Option<String>,
    },
    Error {
        request_id: Option<String>,
        status: u16,
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn parses_unit_queries() {
        let parsed: ClientMessage = serde_json::from_str(r#"{"type": "recommended_engine"}"#).unwrap();
        assert!(matches!(parsed, ClientMessage::RecommendedEngine));
        let parsed: ClientMessage = serde_json::from_str(r#"{"type": "ping"}"#).unwrap();
        assert!(matches!(parsed, ClientMessage::Ping { nonce: None }));
    }

    #[test]
    fn synthesize_gets_a_request_id_when_missing() {
        let parsed: ClientMessage = serde_json::from_value(json!({
            "type": "synthesize",
            "request": {"text": "Hello there.", "engine": "kokoro", "speed": 1.2}
        }))
        .unwrap();
        match parsed {
            ClientMessage::Synthesize {
                request_id,
                request,
            } => {
                assert!(Uuid::parse_str(&request_id).is_ok());
                assert_eq!(request.engine, "kokoro");
                assert_eq!(request.speed, 1.2);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn daemon_messages_are_tagged() {
        let value = serde_json::to_value(DaemonMessage::StreamEnd {
            request_id: "r1".into(),
            bytes: 42,
            error: None,
        })
        .unwrap();
        assert_eq!(
            value,
            json!({"type": "stream_end", "request_id": "r1", "bytes": 42, "error": null})
        );

        let value = serde_json::to_value(DaemonMessage::RecommendedEngine {
            recommended_engine: Engine::CosyVoice2,
        })
        .unwrap();
        assert_eq!(value["recommended_engine"], "cosyvoice2");
    }
}
