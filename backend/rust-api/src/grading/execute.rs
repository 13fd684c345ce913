use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::metrics::SANDBOX_EXECUTIONS_TOTAL;

const SANDBOX_TIMEOUT: Duration = Duration::from_secs(30);
const LOCAL_EXEC_TIMEOUT: Duration = Duration::from_secs(5);
const TIMEOUT_EXIT_CODE: i32 = 124;

/// Outcome of running one program against one stdin. Execution never fails
/// upward; every problem is encoded in the exit code and stderr so the
/// grading pipeline can keep going.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ExecutionResult {
    fn failure(stderr: impl Into<String>) -> Self {
        Self {
            stdout: String::new(),
            stderr: stderr.into(),
            exit_code: 1,
        }
    }

    fn timeout() -> Self {
        Self {
            stdout: String::new(),
            stderr: "Timeout".to_string(),
            exit_code: TIMEOUT_EXIT_CODE,
        }
    }
}

#[async_trait]
pub trait CodeExecutor: Send + Sync {
    async fn execute(&self, code: &str, language: &str, stdin: &str) -> ExecutionResult;
}

/// Judge0-compatible language ids. Unknown languages fall back to Python,
/// which matches how ungraded drafts are treated elsewhere.
pub fn language_id(language: &str) -> u32 {
    match language.to_lowercase().as_str() {
        "python" | "python3" => 71,
        "javascript" | "js" => 63,
        "java" => 62,
        "c" => 50,
        "cpp" | "c++" => 54,
        "go" => 60,
        _ => 71,
    }
}

fn normalize_stdin(stdin: &str) -> String {
    let mut s = stdin.replace("\r\n", "\n");
    if !s.is_empty() && !s.ends_with('\n') {
        s.push('\n');
    }
    s
}

#[derive(Serialize)]
struct SandboxSubmission<'a> {
    source_code: &'a str,
    language_id: u32,
    stdin: &'a str,
}

#[derive(Deserialize)]
struct SandboxStatus {
    id: i32,
}

#[derive(Deserialize)]
struct SandboxResponse {
    #[serde(default)]
    stdout: Option<String>,
    #[serde(default)]
    stderr: Option<String>,
    #[serde(default)]
    compile_output: Option<String>,
    status: SandboxStatus,
}

/// Runs code against a Judge0-shaped sandbox, falling back to a local
/// `python3` subprocess when no sandbox is configured or the sandbox is
/// unreachable.
pub struct SandboxExecutor {
    client: reqwest::Client,
    base_url: Option<String>,
    api_key: Option<String>,
}

impl SandboxExecutor {
    pub fn new(base_url: Option<String>, api_key: Option<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(SANDBOX_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url,
            api_key,
        }
    }

    async fn execute_remote(
        &self,
        base_url: &str,
        code: &str,
        language: &str,
        stdin: &str,
    ) -> Result<ExecutionResult, reqwest::Error> {
        let url = format!(
            "{}/submissions?base64_encoded=false&wait=true",
            base_url.trim_end_matches('/')
        );
        let body = SandboxSubmission {
            source_code: code,
            language_id: language_id(language),
            stdin,
        };

        let mut req = self.client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            req = req.header("X-Auth-Token", key);
        }

        let resp: SandboxResponse = req.send().await?.error_for_status()?.json().await?;

        let stdout = resp.stdout.unwrap_or_default();
        let stderr = resp
            .stderr
            .or(resp.compile_output)
            .unwrap_or_default();

        // Status 3 is Accepted. Status 11 (runtime error) with output still
        // present is treated as success: interactive scripts often exit
        // nonzero after printing the answer.
        let exit_code = match resp.status.id {
            3 => 0,
            11 if !stdout.trim().is_empty() => 0,
            other => other,
        };

        Ok(ExecutionResult {
            stdout,
            stderr,
            exit_code,
        })
    }
}

#[async_trait]
impl CodeExecutor for SandboxExecutor {
    async fn execute(&self, code: &str, language: &str, stdin: &str) -> ExecutionResult {
        let stdin = normalize_stdin(stdin);

        if let Some(base_url) = &self.base_url {
            match self.execute_remote(base_url, code, language, &stdin).await {
                Ok(result) => {
                    SANDBOX_EXECUTIONS_TOTAL
                        .with_label_values(&["remote"])
                        .inc();
                    return result;
                }
                Err(e) => {
                    tracing::warn!("sandbox request failed, trying local fallback: {}", e);
                    SANDBOX_EXECUTIONS_TOTAL.with_label_values(&["error"]).inc();
                }
            }
        }

        if language_id(language) == 71 {
            SANDBOX_EXECUTIONS_TOTAL
                .with_label_values(&["local_fallback"])
                .inc();
            return local_python_execute(code, &stdin).await;
        }

        ExecutionResult::failure(format!("no execution backend available for {}", language))
    }
}

/// Runs Python code in a scratch directory with a hard wall-clock limit.
/// The child is killed when the limit elapses.
pub async fn local_python_execute(code: &str, stdin: &str) -> ExecutionResult {
    use tokio::io::AsyncWriteExt;

    let scratch = std::env::temp_dir().join(format!("exam-exec-{}", Uuid::new_v4()));
    if let Err(e) = tokio::fs::create_dir_all(&scratch).await {
        return ExecutionResult::failure(format!("scratch dir: {}", e));
    }
    let script = scratch.join("main.py");
    if let Err(e) = tokio::fs::write(&script, code).await {
        let _ = tokio::fs::remove_dir_all(&scratch).await;
        return ExecutionResult::failure(format!("write script: {}", e));
    }

    let spawned = tokio::process::Command::new("python3")
        .arg(&script)
        .current_dir(&scratch)
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true)
        .spawn();

    let mut child = match spawned {
        Ok(c) => c,
        Err(e) => {
            let _ = tokio::fs::remove_dir_all(&scratch).await;
            return ExecutionResult::failure(format!("spawn python3: {}", e));
        }
    };

    if let Some(mut sink) = child.stdin.take() {
        let _ = sink.write_all(stdin.as_bytes()).await;
        drop(sink);
    }

    let result = match tokio::time::timeout(LOCAL_EXEC_TIMEOUT, child.wait_with_output()).await {
        Ok(Ok(output)) => ExecutionResult {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(-1),
        },
        Ok(Err(e)) => ExecutionResult::failure(format!("wait: {}", e)),
        Err(_) => ExecutionResult::timeout(),
    };

    let _ = tokio::fs::remove_dir_all(&scratch).await;
    result
}
