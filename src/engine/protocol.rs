//! Run protocol codec
//!
//! Requests and responses are single-line JSON objects tagged by `type`.
//! Responses may carry a `correlationId` (legacy: `reqId`) echoed from the
//! request that triggered them.

use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

use crate::core::utils::is_safe_path;
use crate::core::{CorrelationId, DisplayMode, Editor, ExecutionContext};
use crate::error::{ChannelError, ProtocolError};

/// Error code a sandbox may attach to signal that `input()` ran dry
pub const INPUT_EXHAUSTED_CODE: &str = "input_exhausted";

/// Diagnostic fragments printed by the interpreter when stdin is exhausted
const INPUT_EXHAUSTED_MARKERS: [&str; 2] = ["EOFError", "EOF when reading a line"];

/// Request sent from the coordinator to the sandbox
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "payload")]
pub enum Request {
    #[serde(rename = "LOAD")]
    Load { packages: BTreeSet<String> },
    #[serde(rename = "RUN")]
    Run(RunPayload),
    #[serde(rename = "PROVIDE_INPUT")]
    ProvideInput { input: String },
}

impl Request {
    pub fn run(context: &ExecutionContext) -> Self {
        Request::Run(RunPayload::from(context))
    }

    /// Encode as one protocol line (without the trailing newline)
    pub fn encode(&self) -> Result<String, ChannelError> {
        serde_json::to_string(self).map_err(|e| ChannelError::Encode(e.to_string()))
    }
}

/// Payload of a RUN request; hidden editors are already merged in
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunPayload {
    pub editors: Vec<Editor>,
    pub datasets: BTreeMap<String, Option<String>>,
    pub mode: DisplayMode,
    pub inputs: Vec<String>,
    pub test_mode: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<CorrelationId>,
}

impl From<&ExecutionContext> for RunPayload {
    fn from(context: &ExecutionContext) -> Self {
        Self {
            editors: context.all_editors(),
            datasets: context.datasets.clone(),
            mode: context.mode,
            inputs: context.inputs.clone(),
            test_mode: context.test_mode,
            correlation_id: context.correlation_id.clone(),
        }
    }
}

/// Result of a successful run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionOutput {
    #[serde(default, alias = "resultado", deserialize_with = "null_as_default")]
    pub text: String,
    /// Base64-encoded images captured from the graphics backend
    #[serde(default, alias = "imageDataArray", deserialize_with = "null_as_default")]
    pub images: Vec<String>,
    #[serde(
        default,
        alias = "displayOutputsArray",
        deserialize_with = "null_as_default"
    )]
    pub display_objects: Vec<String>,
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Failure payload: either a plain diagnostic or a structured message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ErrorPayload {
    Text(String),
    Structured {
        message: String,
        /// Output captured before the failure
        #[serde(default)]
        output: Option<String>,
        #[serde(default)]
        code: Option<String>,
    },
}

impl ErrorPayload {
    pub fn message(&self) -> &str {
        match self {
            ErrorPayload::Text(text) => text,
            ErrorPayload::Structured { message, .. } => message,
        }
    }

    pub fn captured_output(&self) -> &str {
        match self {
            ErrorPayload::Structured {
                output: Some(output),
                ..
            } => output,
            _ => "",
        }
    }

    /// Whether the program failed because it ran out of input.
    ///
    /// A structured code wins; otherwise fall back to matching the
    /// interpreter's diagnostic text.
    pub fn is_input_exhausted(&self) -> bool {
        if let ErrorPayload::Structured { code: Some(code), .. } = self {
            return code == INPUT_EXHAUSTED_CODE;
        }
        let message = self.message();
        INPUT_EXHAUSTED_MARKERS
            .iter()
            .any(|marker| message.contains(marker))
    }
}

/// A file produced during execution, offered for download
#[derive(Debug, Clone, PartialEq)]
pub struct FileExport {
    pub file_name: String,
    pub data: Vec<u8>,
}

/// Message received from the sandbox
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerMessage {
    Status { message: String },
    Loaded,
    Output(ExecutionOutput),
    RequestInput { prompt: String },
    Error(ErrorPayload),
    FileExport(FileExport),
    Unknown { kind: String },
    /// A known kind whose payload could not be decoded
    Invalid { kind: String, reason: String },
}

impl WorkerMessage {
    pub fn kind(&self) -> &str {
        match self {
            WorkerMessage::Status { .. } => "status",
            WorkerMessage::Loaded => "loaded",
            WorkerMessage::Output(_) => "output",
            WorkerMessage::RequestInput { .. } => "requestInput",
            WorkerMessage::Error(_) => "error",
            WorkerMessage::FileExport(_) => "fileExport",
            WorkerMessage::Unknown { kind } | WorkerMessage::Invalid { kind, .. } => kind,
        }
    }
}

/// A decoded message plus its optional correlation tag
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub correlation_id: Option<CorrelationId>,
    pub message: WorkerMessage,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMessage {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default, alias = "reqId")]
    correlation_id: Option<CorrelationId>,
    #[serde(default)]
    payload: Option<Value>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    file_name: Option<String>,
    #[serde(default)]
    data: Option<String>,
    #[serde(default)]
    encoding: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileExportFields {
    #[serde(default)]
    file_name: Option<String>,
    #[serde(default)]
    data: Option<String>,
    #[serde(default)]
    encoding: Option<String>,
}

/// Decode one line received from the sandbox.
///
/// Lines that are not a message at all are errors. A known kind with an
/// undecodable payload becomes `WorkerMessage::Invalid` so the call waiting
/// on it can still be settled.
pub fn decode(line: &str) -> Result<Envelope, ProtocolError> {
    let raw: RawMessage =
        serde_json::from_str(line).map_err(|e| ProtocolError::Malformed(e.to_string()))?;

    let message = match raw.kind.as_str() {
        "status" => WorkerMessage::Status {
            message: raw
                .message
                .or_else(|| payload_str(&raw.payload, "message"))
                .unwrap_or_default(),
        },
        "loaded" => WorkerMessage::Loaded,
        "output" => {
            let payload = raw.payload.unwrap_or(Value::Null);
            if payload.is_null() {
                WorkerMessage::Output(ExecutionOutput::default())
            } else {
                match serde_json::from_value(payload) {
                    Ok(output) => WorkerMessage::Output(output),
                    Err(e) => invalid("output", e),
                }
            }
        }
        "requestInput" => WorkerMessage::RequestInput {
            prompt: payload_str(&raw.payload, "prompt").unwrap_or_default(),
        },
        "error" => match raw.payload {
            None | Some(Value::Null) => {
                WorkerMessage::Error(ErrorPayload::Text("Unknown error".to_string()))
            }
            Some(value) => match serde_json::from_value(value) {
                Ok(payload) => WorkerMessage::Error(payload),
                Err(e) => invalid("error", e),
            },
        },
        "fileExport" | "CSV_DATA" => {
            let nested: FileExportFields = match raw.payload {
                Some(value @ Value::Object(_)) => serde_json::from_value(value).map_err(|e| {
                    ProtocolError::InvalidPayload {
                        kind: raw.kind.clone(),
                        reason: e.to_string(),
                    }
                })?,
                _ => FileExportFields::default(),
            };
            let file_name = raw.file_name.or(nested.file_name);
            let data = raw.data.or(nested.data);
            let encoding = raw.encoding.or(nested.encoding);
            WorkerMessage::FileExport(decode_file_export(file_name, data, encoding)?)
        }
        other => WorkerMessage::Unknown {
            kind: other.to_string(),
        },
    };

    Ok(Envelope {
        correlation_id: raw.correlation_id,
        message,
    })
}

fn decode_file_export(
    file_name: Option<String>,
    data: Option<String>,
    encoding: Option<String>,
) -> Result<FileExport, ProtocolError> {
    let file_name = file_name.unwrap_or_default();
    let reject = |reason: &str| ProtocolError::InvalidFileExport {
        file_name: file_name.clone(),
        reason: reason.to_string(),
    };

    if !is_safe_path(&file_name) {
        return Err(reject("file name must be a relative path"));
    }
    let data = data.ok_or_else(|| reject("missing data"))?;

    let bytes = match encoding.as_deref() {
        None | Some("utf8") | Some("utf-8") => data.into_bytes(),
        Some("base64") => general_purpose::STANDARD
            .decode(data.as_bytes())
            .map_err(|e| reject(&format!("invalid base64: {}", e)))?,
        Some(other) => return Err(reject(&format!("unsupported encoding {}", other))),
    };

    Ok(FileExport {
        file_name,
        data: bytes,
    })
}

fn payload_str(payload: &Option<Value>, field: &str) -> Option<String> {
    match payload {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Object(map)) => map.get(field).and_then(Value::as_str).map(str::to_string),
        _ => None,
    }
}

fn invalid(kind: &str, err: serde_json::Error) -> WorkerMessage {
    WorkerMessage::Invalid {
        kind: kind.to_string(),
        reason: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_encode_run_merges_hidden_editors() {
        let mut ctx = ExecutionContext::new([Editor::new("main.py", "print 1")])
            .with_hidden_editor("grader.py", "print 2")
            .with_inputs(["5"])
            .with_test_mode(true);
        ctx.correlation_id = Some(CorrelationId::new("test-1"));

        let line = Request::run(&ctx).encode().unwrap();
        let value: Value = serde_json::from_str(&line).unwrap();

        assert_eq!(value["type"], "RUN");
        assert_eq!(value["payload"]["editors"][1]["id"], "grader.py");
        assert_eq!(value["payload"]["inputs"], json!(["5"]));
        assert_eq!(value["payload"]["testMode"], true);
        assert_eq!(value["payload"]["correlationId"], "test-1");
        assert!(!line.contains('\n'));
    }

    #[test]
    fn test_encode_load_and_provide_input() {
        let load = Request::Load {
            packages: ["numpy".to_string(), "matplotlib".to_string()]
                .into_iter()
                .collect(),
        };
        let value: Value = serde_json::from_str(&load.encode().unwrap()).unwrap();
        assert_eq!(value, json!({"type": "LOAD", "payload": {"packages": ["matplotlib", "numpy"]}}));

        let provide = Request::ProvideInput {
            input: "7".to_string(),
        };
        let value: Value = serde_json::from_str(&provide.encode().unwrap()).unwrap();
        assert_eq!(value, json!({"type": "PROVIDE_INPUT", "payload": {"input": "7"}}));
    }

    #[test]
    fn test_decode_output_with_legacy_fields() {
        let line = r#"{"type":"output","reqId":"test-9","payload":{"resultado":"hi","imageDataArray":null,"displayOutputsArray":["tree"]}}"#;
        let envelope = decode(line).unwrap();

        assert_eq!(envelope.correlation_id, Some(CorrelationId::new("test-9")));
        assert_eq!(
            envelope.message,
            WorkerMessage::Output(ExecutionOutput {
                text: "hi".to_string(),
                images: vec![],
                display_objects: vec!["tree".to_string()],
            })
        );
    }

    #[test]
    fn test_decode_status_and_request_input() {
        let status = decode(r#"{"type":"status","message":"Loading runtime..."}"#).unwrap();
        assert_eq!(
            status.message,
            WorkerMessage::Status {
                message: "Loading runtime...".to_string()
            }
        );

        let request = decode(r#"{"type":"requestInput","payload":{"prompt":"Name? "}}"#).unwrap();
        assert_eq!(
            request.message,
            WorkerMessage::RequestInput {
                prompt: "Name? ".to_string()
            }
        );
        assert!(request.correlation_id.is_none());
    }

    #[test]
    fn test_input_exhaustion_detection() {
        let text = ErrorPayload::Text(
            "Traceback (most recent call last):\nEOFError: EOF when reading a line".to_string(),
        );
        assert!(text.is_input_exhausted());

        let plain = ErrorPayload::Text("ZeroDivisionError: division by zero".to_string());
        assert!(!plain.is_input_exhausted());

        let structured = ErrorPayload::Structured {
            message: "input() has no more values".to_string(),
            output: Some("Name? ".to_string()),
            code: Some(INPUT_EXHAUSTED_CODE.to_string()),
        };
        assert!(structured.is_input_exhausted());
        assert_eq!(structured.captured_output(), "Name? ");

        // An explicit code overrides the text heuristic
        let coded = ErrorPayload::Structured {
            message: "EOFError raised by user code".to_string(),
            output: None,
            code: Some("runtime_error".to_string()),
        };
        assert!(!coded.is_input_exhausted());
    }

    #[test]
    fn test_decode_error_payload_shapes() {
        let text = decode(r#"{"type":"error","payload":"boom"}"#).unwrap();
        assert_eq!(
            text.message,
            WorkerMessage::Error(ErrorPayload::Text("boom".to_string()))
        );

        let missing = decode(r#"{"type":"error"}"#).unwrap();
        assert_eq!(
            missing.message,
            WorkerMessage::Error(ErrorPayload::Text("Unknown error".to_string()))
        );

        let structured =
            decode(r#"{"type":"error","payload":{"message":"EOF","output":"> ","code":"input_exhausted"}}"#)
                .unwrap();
        assert!(matches!(
            structured.message,
            WorkerMessage::Error(ErrorPayload::Structured { .. })
        ));
    }

    #[test]
    fn test_decode_bad_payload_keeps_kind_and_correlation() {
        let output = decode(r#"{"type":"output","correlationId":"test-1-1","payload":{"text":5}}"#)
            .unwrap();
        assert_eq!(output.correlation_id, Some(CorrelationId::new("test-1-1")));
        assert!(matches!(
            output.message,
            WorkerMessage::Invalid { ref kind, .. } if kind == "output"
        ));

        let error = decode(r#"{"type":"error","payload":42}"#).unwrap();
        assert_eq!(error.message.kind(), "error");
        assert!(matches!(error.message, WorkerMessage::Invalid { .. }));
    }

    #[test]
    fn test_decode_file_exports() {
        let legacy = decode(r#"{"type":"CSV_DATA","fileName":"out.csv","data":"a,b\n1,2"}"#).unwrap();
        assert_eq!(
            legacy.message,
            WorkerMessage::FileExport(FileExport {
                file_name: "out.csv".to_string(),
                data: b"a,b\n1,2".to_vec(),
            })
        );

        let binary = decode(
            r#"{"type":"fileExport","payload":{"fileName":"plot.png","data":"aGVsbG8=","encoding":"base64"}}"#,
        )
        .unwrap();
        assert_eq!(
            binary.message,
            WorkerMessage::FileExport(FileExport {
                file_name: "plot.png".to_string(),
                data: b"hello".to_vec(),
            })
        );
    }

    #[test]
    fn test_decode_rejects_unsafe_file_export() {
        let err = decode(r#"{"type":"fileExport","fileName":"../../etc/passwd","data":"x"}"#)
            .unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidFileExport { .. }));
    }

    #[test]
    fn test_decode_unknown_and_malformed() {
        let unknown = decode(r#"{"type":"telemetry","payload":{}}"#).unwrap();
        assert_eq!(
            unknown.message,
            WorkerMessage::Unknown {
                kind: "telemetry".to_string()
            }
        );

        assert!(matches!(
            decode("not json at all"),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(
            decode(r#"{"payload":"missing type"}"#),
            Err(ProtocolError::Malformed(_))
        ));
    }
}
