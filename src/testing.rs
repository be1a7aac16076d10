//! In-memory sandbox for tests
//!
//! Speaks the run protocol over `tokio::io::duplex`. The code of the
//! `main.py` editor is a tiny line-oriented script:
//!
//! | line              | effect                                             |
//! |-------------------|----------------------------------------------------|
//! | `print <text>`    | append `<text>\n` to the output                     |
//! | `echo`            | read the next input and print it                    |
//! | `ask <prompt>`    | print `<prompt>`, send `requestInput`, block        |
//! | `sleep <ms>`      | pause                                               |
//! | `raise <msg>`     | fail with a traceback ending in `<msg>`             |
//! | `export <f> <d>`  | offer file `<f>` with contents `<d>`                |
//! | `import <id>`     | fail unless an editor named `<id>` was sent         |
//! | `dataset <name>`  | print the dataset's content                         |
//! | `emit <line>`     | write `<line>` to the coordinator, `$ID` replaced   |
//! |                   | by the request's correlation id                     |
//! | `hang`            | never answer again                                  |
//! | `crash`           | exit, closing both pipes                            |

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{duplex, AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines};

use crate::core::{Editor, ExecutionContext};
use crate::engine::channel::MessageChannel;
use crate::engine::coordinator::{Coordinator, CoordinatorSettings, Phase};
use crate::engine::launcher::SandboxLauncher;

const PIPE_CAPACITY: usize = 64 * 1024;

#[derive(Clone, Default)]
pub struct ScriptedLauncher {
    launches: Arc<AtomicUsize>,
    fail_next: Arc<AtomicBool>,
    provided: Arc<Mutex<Vec<String>>>,
}

impl ScriptedLauncher {
    pub fn launch_count(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn fail_next_launch(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    /// Values received through PROVIDE_INPUT, across all instances
    pub fn provided_inputs(&self) -> Vec<String> {
        self.provided.lock().unwrap().clone()
    }
}

#[async_trait]
impl SandboxLauncher for ScriptedLauncher {
    async fn launch(&self) -> Result<MessageChannel> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            anyhow::bail!("scripted launch failure");
        }
        self.launches.fetch_add(1, Ordering::SeqCst);

        let (coordinator_side_in, sandbox_out) = duplex(PIPE_CAPACITY);
        let (sandbox_in, coordinator_side_out) = duplex(PIPE_CAPACITY);
        let sandbox = tokio::spawn(fake_sandbox(
            sandbox_in,
            sandbox_out,
            self.provided.clone(),
        ));

        Ok(MessageChannel::from_io(coordinator_side_in, coordinator_side_out).with_task(sandbox))
    }
}

pub fn coordinator() -> (Coordinator, ScriptedLauncher) {
    coordinator_with(CoordinatorSettings {
        load_timeout: Duration::from_secs(5),
        run_timeout: None,
    })
}

pub fn coordinator_with(settings: CoordinatorSettings) -> (Coordinator, ScriptedLauncher) {
    let launcher = ScriptedLauncher::default();
    let coordinator = Coordinator::new(Arc::new(launcher.clone()), settings);
    (coordinator, launcher)
}

pub async fn loaded_coordinator() -> (Coordinator, ScriptedLauncher) {
    let (coordinator, launcher) = coordinator();
    coordinator.load(packages(&["numpy"])).await.unwrap();
    (coordinator, launcher)
}

pub fn packages(names: &[&str]) -> BTreeSet<String> {
    names.iter().map(|name| name.to_string()).collect()
}

/// Interactive context running `script` as main.py
pub fn program(script: &str) -> ExecutionContext {
    ExecutionContext::new([Editor::new("main.py", script)])
}

pub async fn wait_for_phase(coordinator: &Coordinator, phase: Phase) {
    let mut phase_rx = coordinator.watch_phase();
    tokio::time::timeout(Duration::from_secs(5), phase_rx.wait_for(|p| *p == phase))
        .await
        .expect("phase not reached in time")
        .unwrap();
}

type RequestLines = Lines<BufReader<DuplexStream>>;

enum Step {
    Done,
    /// A new request arrived while blocked; it replaces the current run
    Superseded(Value),
    Exit,
}

async fn fake_sandbox(input: DuplexStream, mut output: DuplexStream, provided: Arc<Mutex<Vec<String>>>) {
    let mut requests = BufReader::new(input).lines();
    let mut next: Option<Value> = None;

    loop {
        let request = match next.take() {
            Some(request) => request,
            None => match read_request(&mut requests).await {
                Some(request) => request,
                None => return,
            },
        };

        match request["type"].as_str() {
            Some("LOAD") => {
                write(&mut output, json!({"type": "status", "message": "Loading runtime..."})).await;
                let packages = request["payload"]["packages"].as_array().cloned().unwrap_or_default();
                if packages.iter().any(|p| p == "broken") {
                    write(
                        &mut output,
                        json!({"type": "error", "payload": "Failed to load package broken"}),
                    )
                    .await;
                }
                // Always reports loaded, even after a failure
                write(&mut output, json!({"type": "loaded"})).await;
            }
            Some("RUN") => {
                match run_script(&request["payload"], &mut requests, &mut output, &provided).await {
                    Step::Done => {}
                    Step::Superseded(request) => next = Some(request),
                    Step::Exit => return,
                }
            }
            _ => {}
        }
    }
}

async fn run_script(
    payload: &Value,
    requests: &mut RequestLines,
    output: &mut DuplexStream,
    provided: &Arc<Mutex<Vec<String>>>,
) -> Step {
    let correlation_id = payload.get("correlationId").cloned();
    let test_mode = payload["testMode"].as_bool().unwrap_or(false);
    let editors = payload["editors"].as_array().cloned().unwrap_or_default();
    let script = editors
        .iter()
        .find(|editor| editor["id"] == "main.py")
        .and_then(|editor| editor["code"].as_str())
        .unwrap_or_default()
        .to_string();
    let mut inputs: Vec<String> = payload["inputs"]
        .as_array()
        .map(|values| {
            values
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();
    inputs.reverse();

    let tagged = |mut message: Value| {
        if let Some(id) = &correlation_id {
            message["correlationId"] = id.clone();
        }
        message
    };

    let mut out = String::new();
    for line in script.lines() {
        let (command, arg) = line.split_once(' ').unwrap_or((line, ""));
        match command {
            "print" => {
                out.push_str(arg);
                out.push('\n');
            }
            "echo" => match inputs.pop() {
                Some(value) => {
                    out.push_str(&value);
                    out.push('\n');
                }
                None => {
                    let error = if test_mode {
                        json!({"type": "error", "payload":
                            "Traceback (most recent call last):\n  File \"main.py\", line 1\nEOFError: EOF when reading a line"})
                    } else {
                        json!({"type": "error", "payload": {
                            "message": "EOFError: EOF when reading a line",
                            "output": out,
                            "code": "input_exhausted"
                        }})
                    };
                    write(output, tagged(error)).await;
                    return Step::Done;
                }
            },
            "ask" => {
                out.push_str(arg);
                write(
                    output,
                    tagged(json!({"type": "requestInput", "payload": {"prompt": arg}})),
                )
                .await;
                loop {
                    let Some(request) = read_request(requests).await else {
                        return Step::Exit;
                    };
                    match request["type"].as_str() {
                        Some("PROVIDE_INPUT") => {
                            let value = request["payload"]["input"]
                                .as_str()
                                .unwrap_or_default()
                                .to_string();
                            provided.lock().unwrap().push(value.clone());
                            out.push_str(&value);
                            out.push('\n');
                            break;
                        }
                        Some("RUN") => return Step::Superseded(request),
                        _ => {}
                    }
                }
            }
            "sleep" => {
                let ms = arg.parse().unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(ms)).await;
            }
            "raise" => {
                let message = format!(
                    "Traceback (most recent call last):\n  File \"main.py\", line 1\n{}",
                    arg
                );
                write(output, tagged(json!({"type": "error", "payload": message}))).await;
                return Step::Done;
            }
            "export" => {
                let (file_name, data) = arg.split_once(' ').unwrap_or((arg, ""));
                write(
                    output,
                    json!({"type": "fileExport", "fileName": file_name, "data": data}),
                )
                .await;
            }
            "import" => {
                if !editors.iter().any(|editor| editor["id"] == arg) {
                    let message = format!("ModuleNotFoundError: No module named '{}'", arg);
                    write(output, tagged(json!({"type": "error", "payload": message}))).await;
                    return Step::Done;
                }
            }
            "dataset" => {
                if let Some(content) = payload["datasets"][arg].as_str() {
                    out.push_str(content);
                    out.push('\n');
                }
            }
            "emit" => {
                let id = correlation_id
                    .as_ref()
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                let line = arg.replace("$ID", id);
                let _ = output.write_all(format!("{}\n", line).as_bytes()).await;
            }
            "hang" => std::future::pending::<()>().await,
            "crash" => return Step::Exit,
            _ => {}
        }
    }

    let result = if correlation_id.is_some() {
        json!({"type": "output", "payload": {"text": out, "images": [], "displayObjects": []}})
    } else {
        // Untagged runs answer with the legacy field names
        json!({"type": "output", "payload": {"resultado": out, "imageDataArray": [], "displayOutputsArray": []}})
    };
    write(output, tagged(result)).await;
    Step::Done
}

async fn read_request(requests: &mut RequestLines) -> Option<Value> {
    loop {
        let line = requests.next_line().await.ok()??;
        if let Ok(value) = serde_json::from_str(&line) {
            return Some(value);
        }
    }
}

async fn write(output: &mut DuplexStream, message: Value) {
    let _ = output
        .write_all(format!("{}\n", message).as_bytes())
        .await;
}
