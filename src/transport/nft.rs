use super::{PacketFilter, VerifyResult};
use crate::core::error::{Error, Result, translate_transport_error};
use crate::core::firewall::TableFamily;
use crate::core::observed::ObservedTable;
use async_trait::async_trait;
use serde_json::Value;
use std::process::{Output, Stdio};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Replaces the configured `nft` command line (whitespace separated, so
/// `sudo nft` works)
pub const NFT_COMMAND_ENV: &str = "MESHWALL_NFT_COMMAND";

/// Packet filter backed by the `nft` binary
#[derive(Debug, Clone)]
pub struct NftFilter {
    program: String,
    base_args: Vec<String>,
}

impl NftFilter {
    /// Builds a filter from a command line such as `nft` or `sudo nft`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if the command line is empty.
    pub fn new(command: &str) -> Result<Self> {
        let mut parts = command.split_whitespace().map(str::to_string);
        let program = parts
            .next()
            .ok_or_else(|| Error::invalid_input("nft_command", "command cannot be empty"))?;
        Ok(Self {
            program,
            base_args: parts.collect(),
        })
    }

    /// Uses `MESHWALL_NFT_COMMAND` when set, else `configured`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if the resulting command line is empty.
    pub fn from_env_or(configured: &str) -> Result<Self> {
        let command = std::env::var(NFT_COMMAND_ENV).unwrap_or_else(|_| configured.to_string());
        let filter = Self::new(&command)?;

        if filter.program == "nft" && !nix::unistd::geteuid().is_root() {
            warn!("Not running as root; nft will likely fail with a permission error");
        }
        Ok(filter)
    }

    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.base_args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    async fn run(&self, args: &[&str], stdin: Option<&[u8]>) -> Result<Output> {
        debug!(command = %self.command_line(), ?args, "Spawning nft");

        let mut child = Command::new(&self.program)
            .args(&self.base_args)
            .args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Transport {
                message: format!("failed to spawn {}: {e}", self.program),
                stderr: None,
                exit_code: None,
            })?;

        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input).await?;
            pipe.shutdown().await?;
        }

        Ok(child.wait_with_output().await?)
    }
}

fn failure(output: &Output) -> Error {
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    Error::Transport {
        message: translate_transport_error(&stderr),
        stderr: Some(stderr),
        exit_code: output.status.code(),
    }
}

/// Parses nft error output into user-friendly messages
///
/// Attempts to extract meaningful error information from nft's
/// stderr output, falling back to raw output if parsing fails.
pub fn parse_nft_errors(stderr: &str) -> Vec<String> {
    if let Ok(json_err) = serde_json::from_str::<Value>(stderr)
        && let Some(errors) = json_err.get("errors").and_then(|e| e.as_array())
    {
        return errors
            .iter()
            .filter_map(|e| e.get("message").and_then(|m| m.as_str()))
            .map(String::from)
            .collect();
    }

    stderr
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            line.trim()
                .trim_start_matches("Error: ")
                .trim_start_matches("nft: ")
                .to_string()
        })
        .collect()
}

#[async_trait]
impl PacketFilter for NftFilter {
    async fn fetch(&self, family: TableFamily, table: &str) -> Result<Option<ObservedTable>> {
        let output = self
            .run(&["--json", "list", "table", family.as_ref(), table], None)
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("No such file or directory") {
                debug!(table, "Table not present");
                return Ok(None);
            }
            return Err(failure(&output));
        }

        let listing: Value = serde_json::from_slice(&output.stdout)?;
        ObservedTable::from_listing(&listing, family.as_ref(), table)
    }

    async fn apply(&self, batch: &Value) -> Result<()> {
        let payload = serde_json::to_vec(batch)?;
        let output = self.run(&["--json", "-f", "-"], Some(&payload)).await?;

        if output.status.success() {
            info!("nft batch committed");
            Ok(())
        } else {
            Err(failure(&output))
        }
    }

    async fn check(&self, batch: &Value) -> Result<VerifyResult> {
        let payload = serde_json::to_vec(batch)?;
        let output = self
            .run(&["--json", "--check", "-f", "-"], Some(&payload))
            .await?;

        if output.status.success() {
            Ok(VerifyResult::success())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!("Batch verification failed: {}", stderr.trim());
            Ok(VerifyResult::failure(parse_nft_errors(&stderr)))
        }
    }
}
