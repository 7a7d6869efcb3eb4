use anyhow::Context;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::{FutureExt, StreamExt};
use std::collections::VecDeque;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tempfile::NamedTempFile;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;

use crate::error::GenerationError;

/// Lazy, finite, non-restartable sequence of generated text chunks.
pub type ChunkStream = BoxStream<'static, Result<String, GenerationError>>;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenerationOptions {
    pub max_tokens: u32,
    pub temperature: f32,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            max_tokens: 2048,
            temperature: 0.7,
        }
    }
}

/// The text-generation capability the HTTP adapters are built on.
///
/// Every call opens its own session; implementations must not share mutable
/// state between concurrent calls.
pub trait TextGenerator: Send + Sync {
    fn generate_stream(
        &self,
        prompt: String,
        options: GenerationOptions,
    ) -> BoxFuture<'static, Result<ChunkStream, GenerationError>>;

    /// Runs a full generation and returns the concatenated text.
    fn generate(
        &self,
        prompt: String,
        options: GenerationOptions,
    ) -> BoxFuture<'static, Result<String, GenerationError>> {
        let session = self.generate_stream(prompt, options);
        async move {
            let mut stream = session.await?;
            let mut response = String::new();
            while let Some(chunk) = stream.next().await {
                response.push_str(&chunk?);
            }
            Ok(response)
        }
        .boxed()
    }
}

// Number of stderr lines kept for error reports
const STDERR_TAIL_LINES: usize = 8;

#[derive(Debug)]
struct ModelHandle {
    binary: PathBuf,
    model_path: PathBuf,
    gpu_layers: u32,
}

/// Runs a llama.cpp CLI process per request against one GGUF model.
#[derive(Debug, Clone)]
pub struct LlamaCppEngine {
    model: Arc<ModelHandle>,
}

impl LlamaCppEngine {
    /// Builds an engine without checking that the binary or model exist.
    pub fn new(binary: impl Into<PathBuf>, model_path: impl Into<PathBuf>, gpu_layers: u32) -> Self {
        Self {
            model: Arc::new(ModelHandle {
                binary: binary.into(),
                model_path: model_path.into(),
                gpu_layers,
            }),
        }
    }

    /// Validates the model file and probes the binary before any request is served.
    pub async fn load(
        binary: impl Into<PathBuf>,
        model_path: impl Into<PathBuf>,
        gpu_layers: u32,
    ) -> anyhow::Result<Self> {
        let engine = Self::new(binary, model_path, gpu_layers);
        let handle = &engine.model;

        let metadata = tokio::fs::metadata(&handle.model_path)
            .await
            .with_context(|| format!("Model not found at {}", handle.model_path.display()))?;
        if !metadata.is_file() {
            anyhow::bail!("Model path {} is not a file", handle.model_path.display());
        }

        tracing::info!(binary = %handle.binary.display(), "Probing llama.cpp binary");
        let output = Command::new(&handle.binary)
            .arg("--version")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .with_context(|| format!("Failed to execute {}", handle.binary.display()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("{} --version failed: {}", handle.binary.display(), stderr.trim());
        }

        tracing::info!(
            model = %handle.model_path.display(),
            gpu_layers = handle.gpu_layers,
            "Model ready"
        );
        Ok(engine)
    }

    pub fn model_path(&self) -> &Path {
        &self.model.model_path
    }

    fn command(&self, prompt_file: &Path, options: &GenerationOptions) -> Command {
        let handle = &self.model;
        let mut cmd = Command::new(&handle.binary);
        cmd.arg("-m")
            .arg(&handle.model_path)
            .arg("-f")
            .arg(prompt_file)
            .arg("-n")
            .arg(options.max_tokens.to_string())
            .arg("--temp")
            .arg(options.temperature.to_string())
            .arg("-ngl")
            .arg(handle.gpu_layers.to_string())
            .arg("--no-display-prompt")
            .arg("-no-cnv")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    /// Starts a llama.cpp process for `prompt`. The returned task ends once the
    /// process has exited or been killed.
    fn open_session(
        &self,
        prompt: String,
        options: GenerationOptions,
    ) -> BoxFuture<'static, Result<Session, GenerationError>> {
        let engine = self.clone();
        async move {
            // Prompts go through a file: a single argv entry is capped at 128 KiB on Linux
            let prompt_file = write_prompt_file(&prompt)?;
            let mut child = engine
                .command(prompt_file.path(), &options)
                .spawn()
                .map_err(|e| {
                    GenerationError::Session(format!("Failed to start llama.cpp session: {e}"))
                })?;
            let stdout = child
                .stdout
                .take()
                .ok_or_else(|| GenerationError::Session("llama.cpp stdout unavailable".into()))?;
            let stderr = child
                .stderr
                .take()
                .ok_or_else(|| GenerationError::Session("llama.cpp stderr unavailable".into()))?;

            tracing::debug!(
                pid = child.id(),
                prompt_length = prompt.len(),
                max_tokens = options.max_tokens,
                "Started llama.cpp session"
            );

            // Capacity 1: the reader never runs more than one chunk ahead of the consumer
            let (tx, rx) = mpsc::channel(1);
            let task = tokio::spawn(run_session(child, stdout, stderr, prompt_file, tx));

            Ok(Session {
                chunks: ReceiverStream::new(rx).boxed(),
                task,
            })
        }
        .boxed()
    }
}

struct Session {
    chunks: ChunkStream,
    task: JoinHandle<()>,
}

fn write_prompt_file(prompt: &str) -> Result<NamedTempFile, GenerationError> {
    let mut file = tempfile::Builder::new()
        .prefix("llama-prompt-")
        .suffix(".txt")
        .tempfile()
        .map_err(|e| GenerationError::Session(format!("Failed to create prompt file: {e}")))?;
    file.write_all(prompt.as_bytes())
        .and_then(|_| file.flush())
        .map_err(|e| GenerationError::Session(format!("Failed to write prompt file: {e}")))?;
    Ok(file)
}

impl TextGenerator for LlamaCppEngine {
    fn generate_stream(
        &self,
        prompt: String,
        options: GenerationOptions,
    ) -> BoxFuture<'static, Result<ChunkStream, GenerationError>> {
        self.open_session(prompt, options)
            .map(|session| session.map(|s| s.chunks))
            .boxed()
    }
}

async fn run_session(
    mut child: Child,
    mut stdout: ChildStdout,
    stderr: ChildStderr,
    // removed when the session ends
    _prompt_file: NamedTempFile,
    tx: mpsc::Sender<Result<String, GenerationError>>,
) {
    let stderr_task = tokio::spawn(stderr_tail(stderr));
    let mut decoder = Utf8Decoder::default();
    let mut buf = [0u8; 1024];

    loop {
        match stdout.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let text = decoder.push(&buf[..n]);
                if text.is_empty() {
                    continue;
                }
                if tx.send(Ok(text)).await.is_err() {
                    tracing::debug!("Consumer dropped, killing llama.cpp session");
                    let _ = child.kill().await;
                    return;
                }
            }
            Err(e) => {
                let _ = child.kill().await;
                let _ = tx.send(Err(e.into())).await;
                return;
            }
        }
    }

    let rest = decoder.finish();
    if !rest.is_empty() && tx.send(Ok(rest)).await.is_err() {
        let _ = child.kill().await;
        return;
    }

    match child.wait().await {
        Ok(status) if status.success() => {
            tracing::debug!("llama.cpp session finished");
        }
        Ok(status) => {
            let tail = stderr_task.await.unwrap_or_default();
            tracing::warn!(%status, stderr = %tail, "llama.cpp session failed");
            let message = if tail.is_empty() {
                format!("llama.cpp exited with {status}")
            } else {
                format!("llama.cpp exited with {status}: {tail}")
            };
            let _ = tx.send(Err(GenerationError::Engine(message))).await;
        }
        Err(e) => {
            let _ = tx.send(Err(e.into())).await;
        }
    }
}

async fn stderr_tail(stderr: ChildStderr) -> String {
    let mut lines = BufReader::new(stderr).lines();
    let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::trace!("llama.cpp stderr: {}", line);
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
    tail.into_iter().collect::<Vec<_>>().join("\n").trim().to_string()
}

/// Incremental UTF-8 decoder that holds back a split code point until the
/// rest of it arrives.
#[derive(Debug, Default)]
struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(s) => {
                    out.push_str(s);
                    self.pending.clear();
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(std::str::from_utf8(&self.pending[..valid]).unwrap_or_default());
                    match e.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + bad);
                        }
                        None => {
                            self.pending.drain(..valid);
                            break;
                        }
                    }
                }
            }
        }
        out
    }

    fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }
}
