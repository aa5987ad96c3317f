//! Rewrites the provisioning binary's "cannot downgrade" failure into
//! commands the user can paste into a shell.

use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;

static DOWNGRADE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?s)Unable to safely downgrade existing Kubernetes (?P<current>v?[0-9][\w.+-]*) cluster to (?P<wanted>v?[0-9][\w.+-]*).*?delete -p (?P<profile>\S+)",
    )
    .expect("Invalid regex pattern")
});

/// Environment needed to replay the suggested commands outside the app.
#[derive(Debug, Clone, Copy)]
pub struct ShellContext<'a> {
    /// Name of the profile-home variable, e.g. `MINIKUBE_HOME`
    pub home_var: &'a str,
    pub home: &'a Path,
    pub binary: &'a Path,
}

/// Returns the structured message for a downgrade failure, or `message`
/// unchanged when it is some other failure.
pub fn rewrite(message: &str, shell: ShellContext<'_>) -> String {
    let Some(caps) = DOWNGRADE.captures(message) else {
        return message.to_string();
    };
    let current = &caps["current"];
    let wanted = with_v_prefix(&caps["wanted"]);
    let profile = &caps["profile"];

    let home = shell.home.to_string_lossy();
    let binary = shell.binary.to_string_lossy();
    let binary = shell_words::quote(&binary);

    format!(
        "Unable to safely downgrade existing Kubernetes {current} cluster to {wanted}.\n\
         To recreate the cluster with Kubernetes {wanted}, run:\n\
         \n\
         \x20   export {var}={home}\n\
         \x20   {binary} delete -p {profile}\n\
         \x20   {binary} start -p {profile} --kubernetes-version={wanted}\n",
        var = shell.home_var,
        home = quoted(&home),
    )
}

fn with_v_prefix(version: &str) -> String {
    if version.starts_with('v') {
        version.to_string()
    } else {
        format!("v{version}")
    }
}

/// The export line is always quoted, even when the path needs no escaping.
fn quoted(value: &str) -> String {
    let escaped = shell_words::quote(value);
    if escaped.starts_with('\'') {
        escaped.into_owned()
    } else {
        format!("'{escaped}'")
    }
}
