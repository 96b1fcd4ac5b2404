//! Workflow workspace seeding.
//!
//! On creation a workflow's workspace is initialized from a version-
//! pinned template archive, and each declared repository is shallow-
//! cloned and replayed into the workspace through the content gateway.
//! All of it is best effort: a failed repository never aborts the rest.

use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result};
use bytes::Bytes;
use flate2::read::GzDecoder;
use serde_json::Value;
use tar::Archive;
use tokio::process::Command;
use tracing::{info, warn};
use walkdir::WalkDir;

use super::types::repo_clone_destination;
use crate::auth::redact_url;
use crate::content::ContentClient;
use crate::nested::get_str;
use crate::settings::ServerConfig;

/// Unpack a gzipped tar archive into `(relative path, bytes)` pairs.
/// Directory entries and non-file entries are skipped.
pub fn unpack_archive(bytes: &[u8]) -> Result<Vec<(String, Vec<u8>)>> {
    let mut archive = Archive::new(GzDecoder::new(bytes));
    let mut files = Vec::new();
    for entry in archive.entries().context("reading archive entries")? {
        let mut entry = entry.context("reading archive entry")?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let path = entry
            .path()
            .context("reading entry path")?
            .to_string_lossy()
            .into_owned();
        // Strip the single top-level directory templates ship with.
        let relative = path.split_once('/').map(|(_, rest)| rest).unwrap_or(&path);
        if relative.is_empty() || relative.contains("..") {
            continue;
        }
        let mut contents = Vec::new();
        entry.read_to_end(&mut contents).context("reading entry bytes")?;
        files.push((relative.to_string(), contents));
    }
    Ok(files)
}

/// Download and extract the template archive into the workspace.
pub async fn seed_template(
    http: &reqwest::Client,
    content: &ContentClient,
    config: &ServerConfig,
    token: &str,
    project: &str,
    workspace: &str,
) -> Result<usize> {
    let url = config.spec_kit_archive_url();
    let response = http
        .get(&url)
        .send()
        .await
        .with_context(|| format!("downloading template {url}"))?;
    if !response.status().is_success() {
        anyhow::bail!("template download returned {}", response.status());
    }
    let bytes = response.bytes().await.context("reading template body")?;
    let files =
        tokio::task::spawn_blocking(move || unpack_archive(&bytes)).await??;

    let mut written = 0;
    for (relative, contents) in files {
        let destination = format!("{}/{}", workspace.trim_end_matches('/'), relative);
        match content
            .write_with_retry(token, project, &destination, Bytes::from(contents))
            .await
        {
            Ok(()) => written += 1,
            Err(e) => warn!(path = %destination, error = %e, "template file write failed"),
        }
    }
    info!(project, workspace, written, "seeded workflow workspace from template");
    Ok(written)
}

/// Shallow-clone one repository and replay its files into the workspace.
pub async fn replay_repository(
    content: &ContentClient,
    token: &str,
    project: &str,
    workspace: &str,
    repo: &Value,
) -> Result<usize> {
    let url = get_str(repo, &["url"]).context("repository has no url")?;
    let branch = get_str(repo, &["branch"]).filter(|b| !b.is_empty());
    let destination = repo_clone_destination(workspace, repo);

    let checkout = tempfile::tempdir().context("creating clone directory")?;
    let mut command = Command::new("git");
    command.arg("clone").arg("--depth").arg("1");
    if let Some(branch) = branch {
        command.arg("--branch").arg(branch);
    }
    command.arg(url).arg(checkout.path());
    let output = command.output().await.context("running git clone")?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!(
            "git clone of {} failed: {}",
            redact_url(url),
            redact_url(stderr.trim())
        );
    }

    let mut written = 0;
    for entry in WalkDir::new(checkout.path())
        .into_iter()
        .filter_entry(|e| e.file_name() != std::ffi::OsStr::new(".git"))
    {
        let entry = entry.context("walking clone")?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(checkout.path())
            .context("relativizing clone path")?;
        let target = format!("{}/{}", destination, relative_to_slash(relative));
        let contents = tokio::fs::read(entry.path())
            .await
            .with_context(|| format!("reading {}", entry.path().display()))?;
        match content
            .write_with_retry(token, project, &target, Bytes::from(contents))
            .await
        {
            Ok(()) => written += 1,
            Err(e) => warn!(path = %target, error = %e, "repository file write failed"),
        }
    }
    info!(
        project,
        repo = %redact_url(url),
        destination = %destination,
        written,
        "replayed repository into workspace"
    );
    Ok(written)
}

fn relative_to_slash(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Seed a freshly created workflow: template first, then every declared
/// repository. Failures are logged per step and never propagate.
pub async fn seed_workspace(
    http: &reqwest::Client,
    content: &ContentClient,
    config: &ServerConfig,
    token: &str,
    project: &str,
    workspace: &str,
    repositories: &[Value],
) {
    if let Err(e) = seed_template(http, content, config, token, project, workspace).await {
        warn!(project, workspace, error = %e, "template seeding failed");
    }
    for repo in repositories {
        if let Err(e) = replay_repository(content, token, project, workspace, repo).await {
            warn!(project, error = %e, "repository seeding failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::io::Write;

    fn make_archive(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
        for (path, contents) in files {
            let mut header = tar::Header::new_gnu();
            let name = header.as_old_mut().name.as_mut_slice();
            let bytes = path.as_bytes();
            name[..bytes.len()].copy_from_slice(bytes);
            header.set_size(contents.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append(&header, *contents).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap()
    }

    #[test]
    fn archive_unpacks_without_top_level_dir() {
        let bytes = make_archive(&[
            ("template-v1/README.md", b"readme"),
            ("template-v1/specs/plan.md", b"plan"),
        ]);
        let files = unpack_archive(&bytes).unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].0, "README.md");
        assert_eq!(files[0].1, b"readme");
        assert_eq!(files[1].0, "specs/plan.md");
    }

    #[test]
    fn archive_skips_traversal_entries() {
        let bytes = make_archive(&[("top/../../escape", b"nope"), ("top/ok.txt", b"ok")]);
        let files = unpack_archive(&bytes).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].0, "ok.txt");
    }

    #[test]
    fn relative_paths_use_forward_slashes() {
        let path = Path::new("a").join("b").join("c.txt");
        assert_eq!(relative_to_slash(&path), "a/b/c.txt");
    }
}
