//! File Sync Engine (C5): durable per-workspace file state mirrored to
//! an S3-compatible object store, keyed under `<prefix>/<workspace_id>/`.
//!
//! A workspace's files live on disk on whatever host its container is
//! assigned to, reachable only through that host's container-runtime
//! agent (`ContainerRuntimeClient`) — the control plane never has a
//! local mount of a workspace's tree, the same way it never has a local
//! mount of anything else about a host. So every read or write against
//! a workspace's files is smuggled through `exec` as base64, mirroring
//! `apply_pod_template`'s existing exec calls, never `tokio::fs::*`
//! against this process's own disk.
//!
//! S3's own ETag is an MD5 of the raw bytes only for single-part
//! uploads; multipart uploads produce a composite hash that can't be
//! recomputed locally. So instead of trusting ETag for change detection
//! we stamp every object with an `x-amz-meta-content-sha256` header
//! (base64 of the digest, since metadata values must be header-safe)
//! and compare against that.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::ObjectStoreConfig;
use crate::container_runtime::ContainerRuntimeClient;
use crate::error::AnyError;
use crate::registry::Registry;
use crate::store::WorkspaceStore;
use crate::types::{ServerRecord, WorkspaceId, WorkspaceStatus};

const CONTENT_HASH_META_KEY: &str = "content-sha256";
const PER_OBJECT_TIMEOUT: Duration = Duration::from_secs(30);
const STAT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_WORKSPACE_TARGET: &str = "/home/dev/workspace";
const DEFAULT_DOTFILES_TARGET: &str = "/home/dev";

const DEFAULT_DOTFILES: &[&str] = &[
    ".bashrc",
    ".zshrc",
    ".profile",
    ".gitconfig",
    ".npmrc",
    ".vimrc",
    ".config/starship.toml",
    ".ssh/config",
];

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct RestoreResult {
    pub partial: bool,
    pub failed_files: Vec<String>,
    pub restored_files: usize,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct BackupResult {
    pub uploaded_files: usize,
    pub deleted_files: usize,
    pub failed_files: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct PodTemplate {
    pub env_vars: BTreeMap<String, String>,
    pub pre_install_commands: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct GitIdentity {
    pub name: String,
    pub email: String,
}

struct BackgroundJob {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

#[derive(Clone)]
pub struct FileSyncEngine {
    s3: aws_sdk_s3::Client,
    runtime_client: ContainerRuntimeClient,
    registry: Registry,
    store: WorkspaceStore,
    bucket: String,
    prefix: String,
    error_rate_threshold: f64,
    background: Arc<DashMap<WorkspaceId, BackgroundJob>>,
}

pub async fn build_s3_client(cfg: &ObjectStoreConfig) -> aws_sdk_s3::Client {
    let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
    if let Some(endpoint) = &cfg.endpoint_url {
        loader = loader.endpoint_url(endpoint);
    }
    let shared_config = loader.load().await;
    aws_sdk_s3::Client::new(&shared_config)
}

/// Builds the `sh -c` argv that writes base64-encoded `content` to
/// `remote_path` on the container's own filesystem, creating parent
/// directories and applying `mode` if given. Free function so it's
/// testable without a live host agent.
fn write_script(remote_path: &str, content_b64: &str, mode: Option<u32>) -> Vec<String> {
    let mut script = format!(
        "mkdir -p \"$(dirname {remote_path:?})\" && printf %s {content_b64:?} | base64 -d > {remote_path:?}"
    );
    if let Some(mode) = mode {
        script.push_str(&format!(" && chmod {mode:o} {remote_path:?}"));
    }
    vec!["sh".to_string(), "-c".to_string(), script]
}

/// base64-dumps `remote_path`'s content to stdout; exit non-zero if it
/// doesn't exist.
fn read_script(remote_path: &str) -> Vec<String> {
    vec!["sh".to_string(), "-c".to_string(), format!("base64 {remote_path:?} 2>/dev/null")]
}

fn stat_mode_script(remote_path: &str) -> Vec<String> {
    vec!["sh".to_string(), "-c".to_string(), format!("stat -c %a {remote_path:?} 2>/dev/null")]
}

/// Lists every regular file under `root`, relative to `root`, one per
/// line — `cd` first so the listing is already relative, rather than
/// stripping a prefix back out of absolute paths.
fn list_files_script(root: &str) -> Vec<String> {
    vec![
        "sh".to_string(),
        "-c".to_string(),
        format!("cd {root:?} 2>/dev/null && find . -type f | sed 's#^\\./##'"),
    ]
}

fn exists_script(remote_path: &str) -> Vec<String> {
    vec!["sh".to_string(), "-c".to_string(), format!("test -f {remote_path:?}")]
}

fn is_under_ssh_dir(remote_path: &str) -> bool {
    remote_path.split('/').any(|segment| segment == ".ssh")
}

impl FileSyncEngine {
    pub fn new(
        s3: aws_sdk_s3::Client,
        runtime_client: ContainerRuntimeClient,
        registry: Registry,
        store: WorkspaceStore,
        cfg: &ObjectStoreConfig,
        error_rate_threshold: f64,
    ) -> Self {
        FileSyncEngine {
            s3,
            runtime_client,
            registry,
            store,
            bucket: cfg.bucket.clone(),
            prefix: cfg.prefix.clone(),
            error_rate_threshold,
            background: Arc::new(DashMap::new()),
        }
    }

    fn workspace_prefix(&self, workspace_id: &str) -> String {
        format!("{}/{workspace_id}/", self.prefix.trim_end_matches('/'))
    }

    fn dotfiles_prefix(&self, user_id: &str) -> String {
        format!("{}/users/{user_id}/dotfiles/", self.prefix.trim_end_matches('/'))
    }

    fn content_hash(bytes: &[u8]) -> String {
        let digest = Sha256::digest(bytes);
        base64::engine::general_purpose::STANDARD.encode(digest)
    }

    async fn list_keys(&self, key_prefix: &str) -> Result<Vec<String>, AnyError> {
        let mut keys = Vec::new();
        let mut continuation = None;
        loop {
            let mut req = self
                .s3
                .list_objects_v2()
                .bucket(self.bucket.as_str())
                .prefix(key_prefix);
            if let Some(token) = &continuation {
                req = req.continuation_token(token);
            }
            let resp = req.send().await?;
            for obj in resp.contents() {
                if let Some(key) = obj.key() {
                    keys.push(key.to_string());
                }
            }
            continuation = resp.next_continuation_token().map(str::to_string);
            if continuation.is_none() {
                break;
            }
        }
        Ok(keys)
    }

    /// §4.5: materialise every object under the workspace's key space
    /// into `target` on the assigned host's container, reached through
    /// `runtime_client.exec`. Per-file errors are collected; the
    /// operation still succeeds unless the failure rate crosses
    /// `error_rate_threshold`.
    pub async fn restore(
        &self,
        workspace_id: &str,
        server: &ServerRecord,
        container_id: &str,
        target: Option<&str>,
    ) -> Result<RestoreResult, AnyError> {
        let target = target.unwrap_or(DEFAULT_WORKSPACE_TARGET).trim_end_matches('/').to_string();
        let key_prefix = self.workspace_prefix(workspace_id);
        let keys = self.list_keys(&key_prefix).await?;

        let mut restored = 0usize;
        let mut failed = Vec::new();

        for key in &keys {
            let relative = key.strip_prefix(&key_prefix).unwrap_or(key);
            if relative.is_empty() {
                continue;
            }
            let dest = format!("{target}/{relative}");
            match self.fetch_and_write(server, container_id, key, &dest).await {
                Ok(()) => restored += 1,
                Err(err) => {
                    tracing::warn!(workspace_id, key, error = %err, "restore: failed to materialise object");
                    failed.push(relative.to_string());
                }
            }
        }

        let total = restored + failed.len();
        let partial = total > 0 && (failed.len() as f64 / total as f64) > self.error_rate_threshold;
        Ok(RestoreResult {
            partial,
            failed_files: failed,
            restored_files: restored,
        })
    }

    async fn fetch_and_write(
        &self,
        server: &ServerRecord,
        container_id: &str,
        key: &str,
        dest: &str,
    ) -> Result<(), AnyError> {
        let resp = tokio::time::timeout(
            PER_OBJECT_TIMEOUT,
            self.s3.get_object().bucket(self.bucket.as_str()).key(key).send(),
        )
        .await??;
        let mode = resp
            .metadata()
            .and_then(|m| m.get("mode"))
            .and_then(|m| u32::from_str_radix(m, 8).ok());
        let bytes = resp.body.collect().await?.into_bytes();

        let effective_mode = if is_under_ssh_dir(dest) { Some(0o600) } else { mode };
        self.exec_write_file(server, container_id, dest, &bytes, effective_mode).await
    }

    async fn exec_write_file(
        &self,
        server: &ServerRecord,
        container_id: &str,
        remote_path: &str,
        bytes: &[u8],
        mode: Option<u32>,
    ) -> Result<(), AnyError> {
        let content_b64 = base64::engine::general_purpose::STANDARD.encode(bytes);
        let argv = write_script(remote_path, &content_b64, mode);
        let result = self
            .runtime_client
            .exec(&server.address, server.management_port, container_id, &argv, PER_OBJECT_TIMEOUT)
            .await?;
        anyhow::ensure!(result.exit_code == 0, "remote write to {remote_path} failed: {}", result.stderr);
        Ok(())
    }

    async fn exec_read_file(
        &self,
        server: &ServerRecord,
        container_id: &str,
        remote_path: &str,
    ) -> Result<Option<Vec<u8>>, AnyError> {
        let argv = read_script(remote_path);
        let result = self
            .runtime_client
            .exec(&server.address, server.management_port, container_id, &argv, PER_OBJECT_TIMEOUT)
            .await?;
        if result.exit_code != 0 {
            return Ok(None);
        }
        Ok(Some(base64::engine::general_purpose::STANDARD.decode(result.stdout.trim())?))
    }

    async fn exec_stat_mode(&self, server: &ServerRecord, container_id: &str, remote_path: &str) -> Option<u32> {
        let argv = stat_mode_script(remote_path);
        let result = self
            .runtime_client
            .exec(&server.address, server.management_port, container_id, &argv, STAT_TIMEOUT)
            .await
            .ok()?;
        if result.exit_code != 0 {
            return None;
        }
        u32::from_str_radix(result.stdout.trim(), 8).ok()
    }

    async fn exec_list_files(&self, server: &ServerRecord, container_id: &str, root: &str) -> Vec<String> {
        let argv = list_files_script(root);
        match self
            .runtime_client
            .exec(&server.address, server.management_port, container_id, &argv, PER_OBJECT_TIMEOUT)
            .await
        {
            Ok(result) if result.exit_code == 0 => result
                .stdout
                .lines()
                .map(str::to_string)
                .filter(|l| !l.is_empty())
                .collect(),
            Ok(_) => Vec::new(),
            Err(err) => {
                tracing::warn!(root, error = %err, "failed to list remote files");
                Vec::new()
            }
        }
    }

    async fn exec_file_exists(&self, server: &ServerRecord, container_id: &str, remote_path: &str) -> bool {
        let argv = exists_script(remote_path);
        matches!(
            self.runtime_client
                .exec(&server.address, server.management_port, container_id, &argv, STAT_TIMEOUT)
                .await,
            Ok(result) if result.exit_code == 0
        )
    }

    /// §4.5: upload files under `source` whose content hash differs
    /// from the stored digest. `delete_missing` additionally removes
    /// store objects absent on disk — default false, to protect against
    /// wiping the backup when a container crashed with an empty mount.
    pub async fn backup(
        &self,
        workspace_id: &str,
        server: &ServerRecord,
        container_id: &str,
        source: Option<&str>,
        delete_missing: bool,
    ) -> Result<BackupResult, AnyError> {
        let source = source.unwrap_or(DEFAULT_WORKSPACE_TARGET).trim_end_matches('/').to_string();
        let key_prefix = self.workspace_prefix(workspace_id);

        let relative_files = self.exec_list_files(server, container_id, &source).await;
        let mut uploaded = 0usize;
        let mut failed = Vec::new();
        let mut seen_relative = std::collections::HashSet::new();

        for relative in &relative_files {
            if is_excluded(relative) {
                continue;
            }
            seen_relative.insert(relative.clone());
            let key = format!("{key_prefix}{relative}");
            let remote_path = format!("{source}/{relative}");
            match self.upload_if_changed(server, container_id, &key, &remote_path).await {
                Ok(true) => uploaded += 1,
                Ok(false) => {}
                Err(err) => {
                    tracing::warn!(workspace_id, relative, error = %err, "backup: failed to upload object");
                    failed.push(relative.clone());
                }
            }
        }

        let mut deleted = 0usize;
        if delete_missing {
            for key in self.list_keys(&key_prefix).await? {
                let relative = key.strip_prefix(&key_prefix).unwrap_or(&key);
                if !seen_relative.contains(relative) {
                    if self
                        .s3
                        .delete_object()
                        .bucket(self.bucket.as_str())
                        .key(key.as_str())
                        .send()
                        .await
                        .is_ok()
                    {
                        deleted += 1;
                    }
                }
            }
        }

        Ok(BackupResult {
            uploaded_files: uploaded,
            deleted_files: deleted,
            failed_files: failed,
        })
    }

    async fn upload_if_changed(
        &self,
        server: &ServerRecord,
        container_id: &str,
        key: &str,
        remote_path: &str,
    ) -> Result<bool, AnyError> {
        let bytes = match self.exec_read_file(server, container_id, remote_path).await? {
            Some(bytes) => bytes,
            // Vanished between listing and read (e.g. a build tool's
            // scratch file) — nothing to upload, not a failure.
            None => return Ok(false),
        };
        let hash = Self::content_hash(&bytes);

        let existing_hash = self
            .s3
            .head_object()
            .bucket(self.bucket.as_str())
            .key(key)
            .send()
            .await
            .ok()
            .and_then(|r| r.metadata().and_then(|m| m.get(CONTENT_HASH_META_KEY).cloned()));

        if existing_hash.as_deref() == Some(hash.as_str()) {
            return Ok(false);
        }

        let mode = self.exec_stat_mode(server, container_id, remote_path).await;
        let mut put = self
            .s3
            .put_object()
            .bucket(self.bucket.as_str())
            .key(key)
            .body(bytes.into())
            .metadata(CONTENT_HASH_META_KEY, hash.as_str());
        if let Some(mode) = mode {
            put = put.metadata("mode", format!("{mode:o}"));
        }
        tokio::time::timeout(PER_OBJECT_TIMEOUT, put.send()).await??;
        Ok(true)
    }

    /// Spawns the periodic backup loop. Each tick re-resolves the
    /// workspace's current assignment from the Store/Registry rather
    /// than capturing it once, so a restart onto a different host mid-
    /// loop is picked up automatically. The final backup always runs on
    /// cancellation, before the task exits — `stop_background` awaits
    /// that completion rather than detaching.
    pub fn start_background(&self, workspace_id: WorkspaceId, interval: Duration) {
        let cancel = CancellationToken::new();
        let this = self.clone();
        let loop_token = cancel.clone();
        let wid = workspace_id.clone();
        let handle = tokio::task::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // consume the immediate first tick
            loop {
                tokio::select! {
                    _ = loop_token.cancelled() => break,
                    _ = ticker.tick() => {
                        this.backup_current_assignment(&wid).await;
                    }
                }
            }
            this.backup_current_assignment(&wid).await;
        });
        self.background.insert(workspace_id, BackgroundJob { cancel, handle });
    }

    /// Looks up the workspace's current host assignment and backs it up
    /// if still RUNNING. Skips quietly (at `debug!`) if the workspace
    /// was deleted or has no reachable host — the background loop
    /// outlives individual lifecycle transitions.
    async fn backup_current_assignment(&self, workspace_id: &str) {
        let record = match self.store.get(workspace_id).await {
            Ok(Some(record)) => record,
            Ok(None) => return,
            Err(err) => {
                tracing::warn!(workspace_id, error = %err, "background backup: could not load workspace record");
                return;
            }
        };
        if record.status != WorkspaceStatus::Running {
            tracing::debug!(workspace_id, "background backup: workspace not running, skipping");
            return;
        }
        let (Some(server_id), Some(container_id)) =
            (&record.assigned.server_id, &record.assigned.container_id)
        else {
            return;
        };
        let Some(server) = self.registry.get(server_id) else {
            tracing::debug!(workspace_id, server_id, "background backup: server not in registry, skipping");
            return;
        };
        if let Err(err) = self.backup(workspace_id, &server, container_id, None, false).await {
            tracing::warn!(workspace_id, error = %err, "background backup failed");
        }
    }

    pub async fn stop_background(&self, workspace_id: &WorkspaceId) {
        if let Some((_, job)) = self.background.remove(workspace_id) {
            job.cancel.cancel();
            if let Err(err) = job.handle.await {
                tracing::warn!(workspace_id = %workspace_id, error = %err, "background sync task panicked");
            }
        }
    }

    /// Idempotent: removing an already-empty key space is a no-op.
    pub async fn delete_workspace_files(&self, workspace_id: &str) -> Result<(), AnyError> {
        let key_prefix = self.workspace_prefix(workspace_id);
        let keys = self.list_keys(&key_prefix).await?;
        for chunk in keys.chunks(1000) {
            let ids: Vec<_> = chunk
                .iter()
                .map(|k| {
                    aws_sdk_s3::types::ObjectIdentifier::builder()
                        .key(k.as_str())
                        .build()
                        .expect("key is always set")
                })
                .collect();
            if ids.is_empty() {
                continue;
            }
            self.s3
                .delete_objects()
                .bucket(self.bucket.as_str())
                .delete(
                    aws_sdk_s3::types::Delete::builder()
                        .set_objects(Some(ids))
                        .build()?,
                )
                .send()
                .await?;
        }
        Ok(())
    }

    /// After restore: write exported env vars to shell rc files, then
    /// run `pre_install_commands` in order under a per-command timeout.
    /// A non-zero exit is recorded but never aborts the sequence.
    pub async fn apply_pod_template(
        &self,
        workspace_id: &str,
        server: &ServerRecord,
        container_id: &str,
        template: &PodTemplate,
    ) -> Result<Vec<String>, AnyError> {
        if !template.env_vars.is_empty() {
            let exports: String = template
                .env_vars
                .iter()
                .map(|(k, v)| format!("export {k}={v:?}\n"))
                .collect();
            let append_cmd = vec![
                "sh".to_string(),
                "-c".to_string(),
                format!("printf %s {exports:?} >> /home/dev/.bashrc"),
            ];
            if let Err(err) = self
                .runtime_client
                .exec(&server.address, server.management_port, container_id, &append_cmd, Duration::from_secs(10))
                .await
            {
                tracing::warn!(workspace_id, error = %err, "failed to write pod template env vars");
            }
        }

        let mut failures = Vec::new();
        for command in &template.pre_install_commands {
            let argv = vec!["sh".to_string(), "-c".to_string(), command.clone()];
            match self
                .runtime_client
                .exec(&server.address, server.management_port, container_id, &argv, Duration::from_secs(300))
                .await
            {
                Ok(result) if result.exit_code != 0 => {
                    failures.push(format!("{command}: exit {}", result.exit_code));
                }
                Ok(_) => {}
                Err(err) => failures.push(format!("{command}: {err}")),
            }
        }
        Ok(failures)
    }

    /// Same object-store scheme as `restore`, keyed by
    /// `users/<user_id>/dotfiles/`, plus the git identity document.
    /// Written onto the workspace's container the same way `restore`
    /// materialises workspace files — through `exec`, not a local mount.
    pub async fn sync_user_dotfiles(
        &self,
        workspace_id: &str,
        server: &ServerRecord,
        container_id: &str,
        user_id: &str,
    ) -> Result<(), AnyError> {
        let key_prefix = self.dotfiles_prefix(user_id);

        for relative in DEFAULT_DOTFILES {
            let key = format!("{key_prefix}{relative}");
            let dest = format!("{DEFAULT_DOTFILES_TARGET}/{relative}");
            if let Err(err) = self.fetch_and_write(server, container_id, &key, &dest).await {
                tracing::debug!(workspace_id, user_id, relative, error = %err, "no stored dotfile, skipping");
            }
        }

        if let Some(identity) = self.load_git_identity(user_id).await {
            let gitconfig = format!(
                "[user]\n\tname = {}\n\temail = {}\n",
                identity.name, identity.email
            );
            let dest = format!("{DEFAULT_DOTFILES_TARGET}/.gitconfig");
            if let Err(err) = self.exec_write_file(server, container_id, &dest, gitconfig.as_bytes(), None).await {
                tracing::warn!(workspace_id, user_id, error = %err, "failed to write .gitconfig");
            }
        }
        Ok(())
    }

    async fn load_git_identity(&self, user_id: &str) -> Option<GitIdentity> {
        let identity_key = format!(
            "{}/users/{user_id}/config/git.json",
            self.prefix.trim_end_matches('/')
        );
        let resp = self
            .s3
            .get_object()
            .bucket(self.bucket.as_str())
            .key(identity_key.as_str())
            .send()
            .await
            .ok()?;
        let bytes = resp.body.collect().await.ok()?;
        serde_json::from_slice(&bytes.into_bytes()).ok()
    }

    pub async fn save_user_dotfiles(
        &self,
        _workspace_id: &str,
        server: &ServerRecord,
        container_id: &str,
        user_id: &str,
    ) -> Result<(), AnyError> {
        let key_prefix = self.dotfiles_prefix(user_id);
        for relative in DEFAULT_DOTFILES {
            let remote_path = format!("{DEFAULT_DOTFILES_TARGET}/{relative}");
            if !self.exec_file_exists(server, container_id, &remote_path).await {
                continue;
            }
            let key = format!("{key_prefix}{relative}");
            if let Err(err) = self.upload_if_changed(server, container_id, &key, &remote_path).await {
                tracing::warn!(user_id, relative, error = %err, "failed to save dotfile");
            }
        }
        Ok(())
    }

    pub async fn save_git_identity(&self, user_id: &str, identity: &GitIdentity) -> Result<(), AnyError> {
        let key = format!(
            "{}/users/{user_id}/config/git.json",
            self.prefix.trim_end_matches('/')
        );
        let body = serde_json::to_vec(identity)?;
        self.s3
            .put_object()
            .bucket(self.bucket.as_str())
            .key(key)
            .body(body.into())
            .send()
            .await?;
        Ok(())
    }
}

fn is_excluded(relative: &str) -> bool {
    const EXCLUDES: &[&str] = &[
        "node_modules",
        ".venv",
        "__pycache__",
        "dist",
        "build",
        ".next",
        ".cache",
        ".git",
    ];
    EXCLUDES
        .iter()
        .any(|e| relative.starts_with(e) || relative.contains(&format!("/{e}/")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn excludes_common_noise_directories() {
        assert!(is_excluded("node_modules/left-pad/index.js"));
        assert!(is_excluded(".git/HEAD"));
        assert!(is_excluded("dist/bundle.js"));
        assert!(is_excluded("frontend/.next/cache/foo"));
        assert!(!is_excluded("src/main.rs"));
    }

    #[test]
    fn content_hash_is_stable() {
        let a = FileSyncEngine::content_hash(b"hello");
        let b = FileSyncEngine::content_hash(b"hello");
        assert_eq!(a, b);
        assert_ne!(a, FileSyncEngine::content_hash(b"world"));
    }

    #[test]
    fn is_under_ssh_dir_matches_only_the_directory_component() {
        assert!(is_under_ssh_dir("/home/dev/.ssh/config"));
        assert!(!is_under_ssh_dir("/home/dev/.ssh-backup/config"));
        assert!(!is_under_ssh_dir("/home/dev/workspace/README.md"));
    }

    #[test]
    fn write_script_embeds_path_and_base64_and_applies_mode() {
        let argv = write_script("/home/dev/.bashrc", "aGVsbG8=", Some(0o600));
        assert_eq!(argv[0], "sh");
        assert_eq!(argv[1], "-c");
        assert!(argv[2].contains("base64 -d > \"/home/dev/.bashrc\""));
        assert!(argv[2].contains("aGVsbG8="));
        assert!(argv[2].contains("chmod 600"));
    }

    #[test]
    fn write_script_without_mode_has_no_chmod() {
        let argv = write_script("/home/dev/workspace/a.txt", "aGk=", None);
        assert!(!argv[2].contains("chmod"));
    }

    #[test]
    fn read_script_base64_dumps_the_target_path() {
        let argv = read_script("/home/dev/workspace/a.txt");
        assert!(argv[2].starts_with("base64 "));
        assert!(argv[2].contains("/home/dev/workspace/a.txt"));
    }

    #[test]
    fn list_files_script_cds_then_finds_relative_paths() {
        let argv = list_files_script("/home/dev/workspace");
        assert!(argv[2].contains("cd \"/home/dev/workspace\""));
        assert!(argv[2].contains("find . -type f"));
    }

    #[test]
    fn exists_script_tests_for_a_regular_file() {
        let argv = exists_script("/home/dev/.gitconfig");
        assert_eq!(argv[2], "test -f \"/home/dev/.gitconfig\"");
    }
}
