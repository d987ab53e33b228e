use serde_json::Value;

/// An upstream event, classified by how the bridge must treat it.
#[derive(Clone, Debug, PartialEq)]
pub enum UpstreamEvent {
    AudioDelta {
        response_id: Option<String>,
        item_id: Option<String>,
        delta: String,
    },
    TranscriptDelta {
        response_id: Option<String>,
        item_id: Option<String>,
        delta: String,
    },
    /// The assistant finished speaking one item.
    AssistantTranscriptDone { transcript: String },
    /// The user's speech was transcribed.
    TranscriptionCompleted {
        item_id: Option<String>,
        transcript: String,
    },
    SpeechStarted { item_id: Option<String> },
    FunctionCallCreated { call_id: String, name: String },
    FunctionCallDone {
        call_id: String,
        name: String,
        arguments: String,
    },
    ResponseDone { response: Value },
    Error { error: Value },
    /// Tool plumbing that browsers never see.
    Internal,
    /// Anything else, relayed to browsers verbatim.
    Other,
}

impl UpstreamEvent {
    pub fn parse(text: &str) -> serde_json::Result<Self> {
        let value: Value = serde_json::from_str(text)?;
        Ok(Self::classify(&value))
    }

    pub fn classify(event: &Value) -> Self {
        let kind = event.get("type").and_then(Value::as_str).unwrap_or_default();
        match kind {
            "response.audio.delta" => Self::AudioDelta {
                response_id: str_field(event, "response_id"),
                item_id: str_field(event, "item_id"),
                delta: str_field(event, "delta").unwrap_or_default(),
            },
            "response.audio_transcript.delta" => Self::TranscriptDelta {
                response_id: str_field(event, "response_id"),
                item_id: str_field(event, "item_id"),
                delta: str_field(event, "delta").unwrap_or_default(),
            },
            "response.audio_transcript.done" => Self::AssistantTranscriptDone {
                transcript: str_field(event, "transcript").unwrap_or_default(),
            },
            "conversation.item.input_audio_transcription.completed" => {
                Self::TranscriptionCompleted {
                    item_id: str_field(event, "item_id"),
                    transcript: str_field(event, "transcript").unwrap_or_default(),
                }
            }
            "input_audio_buffer.speech_started" => Self::SpeechStarted {
                item_id: str_field(event, "item_id"),
            },
            "conversation.item.created" => match item_kind(event) {
                Some("function_call") => {
                    let item = &event["item"];
                    match (str_field(item, "call_id"), str_field(item, "name")) {
                        (Some(call_id), Some(name)) => Self::FunctionCallCreated { call_id, name },
                        _ => Self::Internal,
                    }
                }
                Some("function_call_output") => Self::Internal,
                _ => Self::Other,
            },
            "response.output_item.added" if item_kind(event) == Some("function_call") => {
                Self::Internal
            }
            "response.output_item.done" if item_kind(event) == Some("function_call") => {
                let item = &event["item"];
                match (str_field(item, "call_id"), str_field(item, "name")) {
                    (Some(call_id), Some(name)) => Self::FunctionCallDone {
                        call_id,
                        name,
                        arguments: str_field(item, "arguments").unwrap_or_else(|| "{}".into()),
                    },
                    _ => Self::Internal,
                }
            }
            "response.function_call_arguments.delta" | "response.function_call_arguments.done" => {
                Self::Internal
            }
            "response.done" => Self::ResponseDone {
                response: event.get("response").cloned().unwrap_or(Value::Null),
            },
            "error" => Self::Error {
                error: event.get("error").cloned().unwrap_or(Value::Null),
            },
            _ => Self::Other,
        }
    }
}

/// Remove function-call items from a `response.done` payload's output.
pub fn strip_function_calls(mut response: Value) -> Value {
    if let Some(output) = response.get_mut("output").and_then(Value::as_array_mut) {
        output.retain(|item| item.get("type").and_then(Value::as_str) != Some("function_call"));
    }
    response
}

fn str_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(str::to_owned)
}

fn item_kind(event: &Value) -> Option<&str> {
    event.get("item")?.get("type")?.as_str()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn classify(v: Value) -> UpstreamEvent {
        UpstreamEvent::classify(&v)
    }

    #[test]
    fn audio_delta_keeps_ids() {
        let e = classify(json!({
            "type": "response.audio.delta", "response_id": "r1", "item_id": "i1", "delta": "AAA"
        }));
        assert_eq!(
            e,
            UpstreamEvent::AudioDelta {
                response_id: Some("r1".into()),
                item_id: Some("i1".into()),
                delta: "AAA".into(),
            }
        );
    }

    #[test]
    fn function_call_lifecycle() {
        let created = classify(json!({
            "type": "conversation.item.created",
            "item": {"type": "function_call", "call_id": "c1", "name": "search_jobs"}
        }));
        assert_eq!(
            created,
            UpstreamEvent::FunctionCallCreated {
                call_id: "c1".into(),
                name: "search_jobs".into()
            }
        );

        let added = classify(json!({
            "type": "response.output_item.added",
            "item": {"type": "function_call", "call_id": "c1"}
        }));
        assert_eq!(added, UpstreamEvent::Internal);

        let args = classify(json!({"type": "response.function_call_arguments.delta", "delta": "{"}));
        assert_eq!(args, UpstreamEvent::Internal);

        let done = classify(json!({
            "type": "response.output_item.done",
            "item": {"type": "function_call", "call_id": "c1", "name": "search_jobs",
                     "arguments": "{\"query\":\"x\"}"}
        }));
        assert!(matches!(done, UpstreamEvent::FunctionCallDone { ref arguments, .. } if arguments.contains("query")));
    }

    #[test]
    fn message_items_are_forwarded() {
        let e = classify(json!({
            "type": "conversation.item.created",
            "item": {"type": "message", "role": "assistant"}
        }));
        assert_eq!(e, UpstreamEvent::Other);
        let e = classify(json!({
            "type": "response.output_item.done",
            "item": {"type": "message"}
        }));
        assert_eq!(e, UpstreamEvent::Other);
    }

    #[test]
    fn function_call_output_items_are_internal() {
        let e = classify(json!({
            "type": "conversation.item.created",
            "item": {"type": "function_call_output", "call_id": "c1"}
        }));
        assert_eq!(e, UpstreamEvent::Internal);
    }

    #[test]
    fn unknown_types_are_other() {
        assert_eq!(classify(json!({"type": "session.created"})), UpstreamEvent::Other);
        assert_eq!(classify(json!({"no_type": true})), UpstreamEvent::Other);
    }

    #[test]
    fn strip_removes_only_function_calls() {
        let response = json!({
            "id": "r1",
            "output": [
                {"type": "function_call", "call_id": "c1"},
                {"type": "message", "content": []}
            ]
        });
        let stripped = strip_function_calls(response);
        let output = stripped["output"].as_array().unwrap();
        assert_eq!(output.len(), 1);
        assert_eq!(output[0]["type"], "message");
        assert_eq!(stripped["id"], "r1");
    }

    #[test]
    fn parse_rejects_non_json() {
        assert!(UpstreamEvent::parse("not json").is_err());
    }
}
