//! rsync-based workspace storage.

use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};

use super::{
    CopyFromStatus, CopyToStatus, MountOptions, StorageError, StorageResult, WorkspaceStorage,
    shell_quote,
};
use crate::sandbox::{ExecOutput, Sandbox};

/// Printed by the copy scripts when the source directory is missing or empty.
const EMPTY_MARKER: &str = "__skiff_empty__";

/// Configuration for [`RsyncStorage`].
#[derive(Debug, Clone)]
pub struct RsyncStorageConfig {
    /// Where durable storage is mounted inside the sandbox.
    pub mount_path: String,
    /// rsync binary inside the sandbox.
    pub rsync_bin: String,
    /// Mount helper, with `{bucket}` and `{path}` placeholders. When unset the
    /// mount path is only created, which suits a pre-mounted volume.
    pub mount_command: Option<String>,
    /// Timeout for each storage command.
    pub exec_timeout: Duration,
}

impl Default for RsyncStorageConfig {
    fn default() -> Self {
        Self {
            mount_path: "/mnt/durable".to_string(),
            rsync_bin: "rsync".to_string(),
            mount_command: None,
            exec_timeout: Duration::from_secs(120),
        }
    }
}

/// Mirrors sandbox working directories with rsync.
#[derive(Debug, Clone)]
pub struct RsyncStorage {
    config: RsyncStorageConfig,
}

impl RsyncStorage {
    pub fn new(config: RsyncStorageConfig) -> Self {
        Self { config }
    }

    /// Durable directory for a session.
    pub fn remote_dir(&self, session_id: &str) -> StorageResult<String> {
        if session_id.is_empty()
            || session_id == "."
            || session_id == ".."
            || session_id.contains(['/', '\\', '\0'])
        {
            return Err(StorageError::InvalidPath(session_id.to_string()));
        }
        Ok(format!(
            "{}/sessions/{}",
            self.config.mount_path.trim_end_matches('/'),
            session_id
        ))
    }

    async fn run(&self, sandbox: &dyn Sandbox, script: &str) -> StorageResult<ExecOutput> {
        Ok(sandbox.exec(script, self.config.exec_timeout).await?)
    }

    /// `rsync -a SRC/ DST/`, skipping when SRC is missing or empty.
    fn copy_script(&self, src: &str, dst: &str, delete: bool) -> String {
        let src = shell_quote(src);
        let dst = shell_quote(dst);
        let delete = if delete { " --delete" } else { "" };
        format!(
            "if [ ! -d {src} ] || [ -z \"$(ls -A {src} 2>/dev/null)\" ]; then echo {EMPTY_MARKER}; exit 0; fi; \
             mkdir -p {dst} && {rsync} -a{delete} {src}/ {dst}/",
            rsync = self.config.rsync_bin,
        )
    }

    /// Count regular files below `local` and `remote`.
    async fn count_files(
        &self,
        sandbox: &dyn Sandbox,
        local: &str,
        remote: &str,
    ) -> StorageResult<Result<(u64, u64), String>> {
        let script = format!(
            "find {} -type f | wc -l && find {} -type f | wc -l",
            shell_quote(local),
            shell_quote(remote)
        );
        let output = self.run(sandbox, &script).await?;
        if !output.success {
            return Ok(Err(output.failure_summary()));
        }

        let counts: Vec<u64> = output
            .stdout
            .split_whitespace()
            .filter_map(|n| n.parse().ok())
            .collect();
        match counts.as_slice() {
            [local, remote] => Ok(Ok((*local, *remote))),
            _ => Ok(Err(format!(
                "unexpected verify output: {}",
                output.stdout.trim()
            ))),
        }
    }
}

fn describe_failure(output: &ExecOutput) -> String {
    match output.exit_code {
        Some(code) => format!("exit code {}: {}", code, output.failure_summary()),
        None => output.failure_summary(),
    }
}

#[async_trait]
impl WorkspaceStorage for RsyncStorage {
    async fn mount(&self, sandbox: &dyn Sandbox, options: &MountOptions) -> StorageResult<()> {
        if !options.credentials.is_empty() {
            sandbox.set_env(options.credentials.clone()).await?;
        }

        let path = shell_quote(&options.mount_path);
        let script = match &self.config.mount_command {
            Some(template) => {
                let command = template
                    .replace("{bucket}", &shell_quote(&options.bucket))
                    .replace("{path}", &path);
                format!("mkdir -p {path} && {command}")
            }
            None => format!("mkdir -p {path}"),
        };

        let output = self.run(sandbox, &script).await?;
        if !output.success {
            return Err(StorageError::Mount {
                bucket: options.bucket.clone(),
                path: options.mount_path.clone(),
                code: output.exit_code,
                message: output.failure_summary(),
            });
        }

        info!(
            "Mounted {} at {} in sandbox {}",
            options.bucket,
            options.mount_path,
            sandbox.id()
        );
        Ok(())
    }

    async fn copy_to(
        &self,
        sandbox: &dyn Sandbox,
        session_id: &str,
    ) -> StorageResult<CopyToStatus> {
        let local = sandbox.workdir().to_string();
        let remote = self.remote_dir(session_id)?;

        let output = self
            .run(sandbox, &self.copy_script(&local, &remote, true))
            .await?;
        if !output.success {
            let detail = describe_failure(&output);
            warn!("rsync to durable storage failed for {}: {}", session_id, detail);
            return Ok(CopyToStatus::RsyncFailed(detail));
        }
        if output.stdout.trim() == EMPTY_MARKER {
            debug!("No local data to sync for {}", session_id);
            return Ok(CopyToStatus::NoLocalData);
        }

        match self.count_files(sandbox, &local, &remote).await? {
            Ok((local_count, remote_count)) if local_count == remote_count => {
                debug!("Synced {} files for {}", local_count, session_id);
                Ok(CopyToStatus::Synced)
            }
            Ok((local_count, remote_count)) => Ok(CopyToStatus::VerifyFailed(format!(
                "{local_count} local files, {remote_count} remote"
            ))),
            Err(detail) => Ok(CopyToStatus::VerifyFailed(detail)),
        }
    }

    async fn copy_from(
        &self,
        sandbox: &dyn Sandbox,
        session_id: &str,
    ) -> StorageResult<CopyFromStatus> {
        let local = sandbox.workdir().to_string();
        let remote = self.remote_dir(session_id)?;

        let output = self
            .run(sandbox, &self.copy_script(&remote, &local, false))
            .await?;
        if !output.success {
            let detail = describe_failure(&output);
            warn!("rsync from durable storage failed for {}: {}", session_id, detail);
            return Ok(CopyFromStatus::RsyncFailed(detail));
        }
        if output.stdout.trim() == EMPTY_MARKER {
            debug!("No remote data to restore for {}", session_id);
            return Ok(CopyFromStatus::NoRemoteData);
        }

        // The workspace may already hold files the agent created since start.
        match self.count_files(sandbox, &local, &remote).await? {
            Ok((local_count, remote_count)) if local_count >= remote_count => {
                info!("Restored {} files for {}", remote_count, session_id);
                Ok(CopyFromStatus::Restored)
            }
            Ok((local_count, remote_count)) => Ok(CopyFromStatus::VerifyFailed(format!(
                "{local_count} local files, {remote_count} remote"
            ))),
            Err(detail) => Ok(CopyFromStatus::VerifyFailed(detail)),
        }
    }

    async fn flush(&self, sandbox: &dyn Sandbox) -> StorageResult<()> {
        let output = self.run(sandbox, "sync").await?;
        if output.success {
            Ok(())
        } else {
            Err(StorageError::Command {
                operation: "flush",
                message: describe_failure(&output),
            })
        }
    }

    /// A workspace only counts when it has entries. Providers create the
    /// directory on provision, so a recycled sandbox shows up empty.
    async fn source_exists(&self, sandbox: &dyn Sandbox) -> StorageResult<bool> {
        let dir = shell_quote(sandbox.workdir());
        let script = format!("test -d {dir} && test -n \"$(ls -A {dir} 2>/dev/null)\"");
        Ok(self.run(sandbox, &script).await?.success)
    }
}
