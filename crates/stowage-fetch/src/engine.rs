//! Container engine abstraction
//!
//! Image pulls are delegated to an external engine. [`DockerCli`] drives the
//! `docker` executable; tests substitute an in-memory implementation.

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::error::{FetchError, Result};

/// Environment for engine invocations
#[derive(Debug, Clone, Default)]
pub struct EngineEnv {
    /// `DOCKER_CONFIG` directory
    pub docker_config: Option<PathBuf>,
    /// Prepended to `PATH` so the engine finds the credential helper
    pub path_prefix: Option<PathBuf>,
    /// Extra variables, e.g. the helper's encryption password
    pub vars: Vec<(String, String)>,
}

/// What the engine reports about a pulled image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageDetails {
    pub digest: String,
    pub size: u64,
}

#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Log in to `server`, passing the password without exposing it in argv
    async fn login(&self, server: &str, username: &str, password: &str, env: &EngineEnv) -> Result<()>;

    async fn pull(&self, image: &str, env: &EngineEnv) -> Result<()>;

    async fn inspect(&self, image: &str, env: &EngineEnv) -> Result<ImageDetails>;

    /// Repository digests of every locally stored image of `repository`
    async fn local_digests(&self, repository: &str, env: &EngineEnv) -> Result<Vec<String>>;
}

/// `docker` command-line implementation
#[derive(Debug, Clone)]
pub struct DockerCli {
    executable: String,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new("docker")
    }
}

impl DockerCli {
    pub fn new(executable: impl Into<String>) -> Self {
        Self {
            executable: executable.into(),
        }
    }

    fn command(&self, env: &EngineEnv) -> Command {
        let mut cmd = Command::new(&self.executable);
        if let Some(config) = &env.docker_config {
            cmd.env("DOCKER_CONFIG", config);
        }
        if let Some(prefix) = &env.path_prefix {
            let current = std::env::var_os("PATH").unwrap_or_default();
            let mut paths = vec![prefix.clone()];
            paths.extend(std::env::split_paths(&current));
            if let Ok(joined) = std::env::join_paths(paths) {
                cmd.env("PATH", joined);
            }
        }
        for (key, value) in &env.vars {
            cmd.env(key, value);
        }
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        cmd
    }

    async fn run(&self, mut cmd: Command, description: &str) -> Result<String> {
        tracing::debug!("Running {} {}", self.executable, description);
        let output = cmd.output().await.map_err(|e| FetchError::ContainerEngine {
            message: format!("Failed to run {}: {}", self.executable, e),
        })?;

        if !output.status.success() {
            return Err(FetchError::ContainerEngine {
                message: format!(
                    "{} {} failed: {}",
                    self.executable,
                    description,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

#[async_trait]
impl ContainerEngine for DockerCli {
    async fn login(&self, server: &str, username: &str, password: &str, env: &EngineEnv) -> Result<()> {
        let mut cmd = self.command(env);
        cmd.args(["login", "--username", username, "--password-stdin", server])
            .stdin(Stdio::piped());

        let mut child = cmd.spawn().map_err(|e| FetchError::ContainerEngine {
            message: format!("Failed to run {}: {}", self.executable, e),
        })?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(password.as_bytes()).await?;
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(FetchError::ContainerEngine {
                message: format!(
                    "Unable to log in Docker registry {}: {}",
                    server,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }
        Ok(())
    }

    async fn pull(&self, image: &str, env: &EngineEnv) -> Result<()> {
        let mut cmd = self.command(env);
        cmd.args(["pull", image]);
        self.run(cmd, &format!("pull {}", image)).await.map(|_| ())
    }

    async fn inspect(&self, image: &str, env: &EngineEnv) -> Result<ImageDetails> {
        let mut cmd = self.command(env);
        cmd.args(["image", "inspect", "--format", "{{.Id}} {{.Size}}", image]);
        let stdout = self.run(cmd, &format!("image inspect {}", image)).await?;
        parse_inspect_output(&stdout).ok_or_else(|| FetchError::ContainerEngine {
            message: format!("Unexpected inspect output for {}: {}", image, stdout.trim()),
        })
    }

    async fn local_digests(&self, repository: &str, env: &EngineEnv) -> Result<Vec<String>> {
        let mut cmd = self.command(env);
        cmd.args(["images", "--digests", "--format", "{{.Digest}}", repository]);
        let stdout = self.run(cmd, &format!("images {}", repository)).await?;
        Ok(stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && *l != "<none>")
            .map(str::to_string)
            .collect())
    }
}

fn parse_inspect_output(stdout: &str) -> Option<ImageDetails> {
    let mut parts = stdout.split_whitespace();
    let digest = parts.next()?.to_string();
    let size = parts.next()?.parse().ok()?;
    Some(ImageDetails { digest, size })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_inspect_output() {
        assert_eq!(
            parse_inspect_output("sha256:abc123 7048192\n"),
            Some(ImageDetails {
                digest: "sha256:abc123".into(),
                size: 7048192
            })
        );
        assert_eq!(parse_inspect_output("sha256:abc123"), None);
        assert_eq!(parse_inspect_output(""), None);
    }

    #[tokio::test]
    async fn test_missing_executable_is_engine_error() {
        let cli = DockerCli::new("stowage-test-no-such-engine");
        let err = cli.pull("alpine:3", &EngineEnv::default()).await.unwrap_err();
        assert!(matches!(err, FetchError::ContainerEngine { .. }));
    }
}
