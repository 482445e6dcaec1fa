#![forbid(unsafe_code)]

use cx_core::JobId;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::process::{ExitStatus, Stdio};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

const STDERR_TAIL_CHARS: usize = 400;

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct CommandSpec {
    pub(crate) program: String,
    pub(crate) args: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum CommandFailure {
    /// The command answered with `{"error": {"kind", "message"}}`.
    Reported { kind: String, message: String },
    /// No usable answer: spawn error, crash, or unparsable output.
    Broken(String),
}

impl CommandFailure {
    pub(crate) fn kind(&self) -> &str {
        match self {
            Self::Reported { kind, .. } => kind,
            Self::Broken(_) => "",
        }
    }

    pub(crate) fn into_message(self) -> String {
        match self {
            Self::Reported { message, .. } => message,
            Self::Broken(message) => message,
        }
    }
}

#[derive(serde::Deserialize)]
struct ErrorBody {
    #[serde(default)]
    kind: String,
    #[serde(default)]
    message: String,
}

#[derive(serde::Deserialize)]
#[serde(rename_all = "lowercase")]
enum Envelope<T> {
    Ok(T),
    Error(ErrorBody),
}

fn tail(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    let trimmed = text.trim();
    let count = trimmed.chars().count();
    if count <= STDERR_TAIL_CHARS {
        return trimmed.to_string();
    }
    trimmed.chars().skip(count - STDERR_TAIL_CHARS).collect()
}

/// Reads the answer envelope. Only the last non-empty stdout line counts, so
/// commands may log progress to stdout before answering.
pub(crate) fn parse_response<T: DeserializeOwned>(
    status: Option<ExitStatus>,
    stdout: &[u8],
    stderr: &[u8],
) -> Result<T, CommandFailure> {
    let text = String::from_utf8_lossy(stdout);
    let last_line = text.lines().rev().map(str::trim).find(|line| !line.is_empty());
    let parsed = last_line.map(serde_json::from_str::<Envelope<T>>);

    match parsed {
        Some(Ok(Envelope::Ok(value))) => Ok(value),
        Some(Ok(Envelope::Error(body))) => Err(CommandFailure::Reported {
            kind: body.kind,
            message: if body.message.is_empty() {
                "command reported an error".to_string()
            } else {
                body.message
            },
        }),
        Some(Err(err)) if status.is_none_or(|s| s.success()) => {
            Err(CommandFailure::Broken(format!("unparsable command output: {err}")))
        }
        _ => {
            let status = status.map_or_else(|| "unknown".to_string(), |s| s.to_string());
            let stderr = tail(stderr);
            Err(CommandFailure::Broken(if stderr.is_empty() {
                format!("command exited with {status}")
            } else {
                format!("command exited with {status}: {stderr}")
            }))
        }
    }
}

/// Runs `spec` once with `request` on stdin. The child is killed if the
/// returned future is dropped.
pub(crate) async fn invoke<Req, Resp>(
    spec: &CommandSpec,
    stage: &str,
    job_id: Option<&JobId>,
    request: &Req,
) -> Result<Resp, CommandFailure>
where
    Req: Serialize + ?Sized,
    Resp: DeserializeOwned,
{
    let payload = serde_json::to_vec(request)
        .map_err(|err| CommandFailure::Broken(format!("encode request failed: {err}")))?;

    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .env("CX_STAGE", stage)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(job_id) = job_id {
        cmd.env("CX_JOB_ID", job_id.as_str());
    }

    let mut child = cmd
        .spawn()
        .map_err(|err| CommandFailure::Broken(format!("spawn {} failed: {err}", spec.program)))?;
    // stdout and stderr are drained while the request is written, so a
    // command that answers before reading all of stdin cannot stall us.
    let stdin = child.stdin.take();
    let write = async move {
        let Some(mut stdin) = stdin else {
            return Ok(());
        };
        let written = stdin.write_all(&payload).await;
        // Closing stdin signals end of request.
        drop(stdin);
        written
    };
    let (written, output) = tokio::join!(write, child.wait_with_output());
    let output =
        output.map_err(|err| CommandFailure::Broken(format!("wait for {stage} failed: {err}")))?;
    match written {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::BrokenPipe => {
            tracing::debug!(stage, "command closed stdin before reading the full request");
        }
        Err(err) => {
            return Err(CommandFailure::Broken(format!(
                "write {stage} stdin failed: {err}"
            )));
        }
    }
    tracing::debug!(
        stage,
        program = %spec.program,
        status = %output.status,
        "command finished"
    );
    parse_response(Some(output.status), &output.stdout, &output.stderr)
}
