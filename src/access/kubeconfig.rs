use std::path::PathBuf;

use kube::config::{KubeConfigOptions, Kubeconfig};

use crate::error::{BackendError, Result};

// ── helpers ───────────────────────────────────────────────────────────────────

/// Merges `extra` into `base` by extending clusters, auth_infos, and contexts.
/// `base.current_context` wins; `extra.current_context` is used only if base has none.
fn merge_kubeconfig(mut base: Kubeconfig, extra: Kubeconfig) -> Kubeconfig {
    base.clusters.extend(extra.clusters);
    base.auth_infos.extend(extra.auth_infos);
    base.contexts.extend(extra.contexts);
    if base.current_context.is_none() {
        base.current_context = extra.current_context;
    }
    base
}

/// Tries to load each path as a kubeconfig and merges all that succeed.
pub fn load_from_paths(paths: &[PathBuf]) -> Option<Kubeconfig> {
    let mut merged: Option<Kubeconfig> = None;

    for path in paths {
        if !path.exists() {
            log::debug!("kubeconfig: skip (not found) {}", path.display());
            continue;
        }

        match Kubeconfig::read_from(path) {
            Ok(cfg) => {
                log::debug!(
                    "kubeconfig: loaded {} context(s) from {}",
                    cfg.contexts.len(),
                    path.display()
                );
                merged = Some(match merged.take() {
                    None => cfg,
                    Some(base) => merge_kubeconfig(base, cfg),
                });
            }
            Err(e) => {
                log::warn!("kubeconfig: skip (parse error: {e}) {}", path.display());
            }
        }
    }

    merged
}

/// Loads the kubeconfig and pins its active context to `context`.
pub fn pin_context(paths: &[PathBuf], context: &str) -> Result<Kubeconfig> {
    let mut kubeconfig = load_from_paths(paths).ok_or_else(|| {
        BackendError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "no readable kubeconfig found",
        ))
    })?;
    kubeconfig.current_context = Some(context.to_string());
    Ok(kubeconfig)
}

/// Builds an API client for the cluster's profile context.
pub async fn client_for_context(paths: &[PathBuf], context: &str) -> Result<kube::Client> {
    let kubeconfig = pin_context(paths, context)?;
    let options = KubeConfigOptions {
        context: Some(context.to_string()),
        ..Default::default()
    };
    let config = kube::Config::from_custom_kubeconfig(kubeconfig, &options).await?;
    Ok(kube::Client::try_from(config)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_config(dir: &std::path::Path, file: &str, context: &str) -> PathBuf {
        let path = dir.join(file);
        let yaml = format!(
            "apiVersion: v1\nkind: Config\ncurrent-context: {context}\n\
             clusters:\n- name: {context}\n  cluster:\n    server: https://127.0.0.1:6443\n\
             contexts:\n- name: {context}\n  context:\n    cluster: {context}\n    user: {context}\n\
             users:\n- name: {context}\n  user: {{}}\n"
        );
        std::fs::write(&path, yaml).unwrap();
        path
    }

    #[test]
    fn merges_every_readable_file() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_config(dir.path(), "a", "first");
        let b = write_config(dir.path(), "b", "cluster-backend");
        let missing = dir.path().join("missing");

        let merged = load_from_paths(&[a, missing, b]).unwrap();
        assert_eq!(merged.contexts.len(), 2);
        assert_eq!(merged.current_context.as_deref(), Some("first"));
    }

    #[test]
    fn pins_profile_context() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_config(dir.path(), "a", "first");
        let pinned = pin_context(&[a], "cluster-backend").unwrap();
        assert_eq!(pinned.current_context.as_deref(), Some("cluster-backend"));
    }

    #[test]
    fn no_config_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(pin_context(&[dir.path().join("nope")], "x").is_err());
    }
}
