use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;

use super::{BuildInvocationResult, BuildTool, InvocationRequest, ProcessTracker};
use crate::config::BuildConfig;

/// Environment variable carrying the acting identity into the build.
pub const USER_ID_ENV: &str = "AUTOGRADER_USER_ID";
pub const TRIMMED_MARKER: &str = "*** Trimmed here ***";

/// Runs `clean compile test` through the configured Maven-compatible command line.
pub struct MavenInvoker {
    config: BuildConfig,
}

impl MavenInvoker {
    pub fn new(config: BuildConfig) -> Self {
        Self { config }
    }

    /// JVM flags substituted for the descriptor's placeholder.
    fn arg_line(&self, request: &InvocationRequest) -> String {
        let mut parts = Vec::new();
        if let Some(max_memory_mb) = request.max_memory_mb {
            parts.push(format!("-Xmx{max_memory_mb}M"));
        }
        if let Some(principal) = &request.principal {
            parts.push(format!("-D{}={principal}", self.config.identity_property));
        }
        parts.extend(self.config.extra_arg_line.iter().cloned());
        parts.join(" ")
    }

    /// Writes the descriptor copy with the arg line in place of the placeholder.
    fn rewrite_descriptor(&self, project_folder: &Path, arg_line: &str) -> Result<RewrittenDescriptor> {
        let template_path = project_folder.join(&self.config.descriptor);
        let template = fs::read_to_string(&template_path).with_context(|| {
            format!("Failed to read build descriptor {}", template_path.display())
        })?;

        let path = project_folder.join(&self.config.rewritten_descriptor);
        fs::write(
            &path,
            template.replace(&self.config.arg_line_placeholder, arg_line),
        )
        .with_context(|| format!("Failed to write build descriptor {}", path.display()))?;

        Ok(RewrittenDescriptor(path))
    }

    fn ensure_repository(&self) -> PathBuf {
        let repository = &self.config.repository;
        if !repository.exists()
            && let Err(e) = fs::create_dir_all(repository)
        {
            log::error!(
                "Couldn't create the local repository folder {}: {e}",
                repository.display()
            );
        }
        std::path::absolute(repository).unwrap_or_else(|_| repository.clone())
    }
}

#[async_trait]
impl BuildTool for MavenInvoker {
    async fn run(
        &self,
        request: &InvocationRequest,
        tracker: &ProcessTracker,
    ) -> Result<BuildInvocationResult> {
        let repository = self.ensure_repository();

        if tracker.is_terminated() {
            return Ok(BuildInvocationResult::expired(Vec::new()));
        }

        let arg_line = self.arg_line(request);
        let descriptor = self.rewrite_descriptor(&request.project_folder, &arg_line)?;

        let descriptor_path = descriptor.0.to_string_lossy().into_owned();
        let repository_path = repository.to_string_lossy().into_owned();
        let command = apply_template(
            &self.config.command,
            &[
                ("%DESCRIPTOR%", descriptor_path.as_str()),
                ("%REPOSITORY%", repository_path.as_str()),
            ],
        );
        let Some((program, args)) = command.split_first() else {
            bail!("Empty build command");
        };

        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args)
            .current_dir(&request.project_folder)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);
        if let Some(principal) = &request.principal {
            cmd.env(USER_ID_ENV, principal);
        }
        if let Some(maven_home) = &self.config.maven_home {
            cmd.env("MAVEN_HOME", maven_home);
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to start build tool '{program}'"))?;
        if let Some(pid) = child.id()
            && !tracker.attach(pid)
        {
            log::warn!("Build in {} started after its job expired", request.project_folder.display());
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        forward_lines(child.stdout.take(), tx.clone());
        forward_lines(child.stderr.take(), tx);

        let mut collector = OutputCollector::new(self.config.too_much_output_threshold);
        while let Some(line) = rx.recv().await {
            if self.config.show_output {
                log::debug!(">>> {line}");
            }
            collector.push(line);
        }

        let status = child.wait().await;
        tracker.detach();
        let status = status.context("Failed to wait for the build tool")?;

        if tracker.is_terminated() {
            log::error!("Build execution too long. Aborting...");
            return Ok(BuildInvocationResult::expired(collector.into_lines()));
        }

        let exit_code = status.code().unwrap_or(-1);
        if exit_code != 0 {
            log::warn!("Build tool ended with exit code {exit_code}");
        }

        Ok(BuildInvocationResult {
            exit_code,
            output_lines: collector.into_lines(),
            expired_by_timeout: false,
        })
    }
}

/// Deletes the rewritten descriptor on every exit path.
struct RewrittenDescriptor(PathBuf);

impl Drop for RewrittenDescriptor {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.0) {
            log::warn!("Unable to remove {}: {e}", self.0.display());
        }
    }
}

fn apply_template(template: &[String], mapping: &[(&str, &str)]) -> Vec<String> {
    template
        .iter()
        .map(|s| {
            let mut t = s.clone();
            for (k, v) in mapping {
                t = t.replace(k, v);
            }
            t
        })
        .collect()
}

fn forward_lines<R>(reader: Option<R>, tx: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let Some(reader) = reader else {
        return;
    };

    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf);
                    let line = line.trim_end_matches(['\n', '\r']).to_string();
                    if tx.send(line).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    log::warn!("Failed to read build output: {e}");
                    break;
                }
            }
        }
    });
}

/// Keeps build output up to a threshold. Stack trace frames are kept but not counted.
pub(crate) struct OutputCollector {
    lines: Vec<String>,
    counted: usize,
    threshold: usize,
    trimmed: bool,
}

impl OutputCollector {
    pub(crate) fn new(threshold: usize) -> Self {
        Self {
            lines: Vec::new(),
            counted: 0,
            threshold,
            trimmed: false,
        }
    }

    pub(crate) fn push(&mut self, line: String) {
        if !line.starts_with("\tat ") {
            self.counted += 1;
        }
        if self.counted < self.threshold {
            self.lines.push(line);
        } else if !self.trimmed {
            self.trimmed = true;
            self.lines.push(TRIMMED_MARKER.to_string());
        }
    }

    pub(crate) fn into_lines(self) -> Vec<String> {
        self.lines
    }
}
