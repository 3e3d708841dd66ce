pub mod commands;
pub mod forks;
pub mod github;
pub mod logger;
pub mod project;
pub mod settings;

pub mod util {
    use std::{ffi::OsStr, process::Stdio};

    use anyhow::{bail, Context};

    /// Returned by every network call that was interrupted by the process-wide cancellation token.
    #[derive(Debug, thiserror::Error)]
    #[error("operation cancelled")]
    pub struct Cancelled;

    /// Reports whether `Cancelled` appears anywhere in the error chain.
    pub fn is_cancelled(err: &anyhow::Error) -> bool {
        err.chain().any(|cause| cause.is::<Cancelled>())
    }

    pub fn git_cmd_helper<I, K>(args: I) -> anyhow::Result<String>
    where
        I: IntoIterator<Item = K>,
        K: AsRef<OsStr>,
    {
        let mut cmd = std::process::Command::new("git");
        cmd.args(args)
            .stdin(Stdio::null())
            // git's own complaints are more useful than ours
            .stderr(Stdio::inherit());

        let context = format!("running {cmd:?}");

        let output = cmd.output().context(context.clone())?;
        if !output.status.success() {
            bail!("{context} failed with {}.", output.status);
        }

        let stdout = String::from_utf8(output.stdout).context(context)?;
        Ok(stdout.trim().to_string())
    }

    pub fn git_remote_url(remote: &str) -> anyhow::Result<String> {
        git_cmd_helper(["remote", "get-url", remote])
    }

    /// Splits a GitHub remote URL into `(owner, repo)`.
    ///
    /// Understands the https, scp-like and ssh:// forms, with or without a `.git` suffix.
    pub fn parse_owner_repo(url: &str) -> anyhow::Result<(String, String)> {
        const REMOTE_RE: &str = r"^(?:https://github\.com/|git@github\.com:|ssh://git@github\.com/)([^/\s]+)/([^/\s]+?)(?:\.git)?/?$";

        let compiled_re = pcre2::bytes::Regex::new(REMOTE_RE)?;
        let captures = compiled_re
            .captures(url.as_bytes())?
            .ok_or_else(|| anyhow::anyhow!("invalid remote URL: {url}"))?;

        let group = |i: usize| -> anyhow::Result<String> {
            let m = captures
                .get(i)
                .ok_or_else(|| anyhow::anyhow!("invalid remote URL: {url}"))?;
            Ok(String::from_utf8_lossy(m.as_bytes()).into_owned())
        };

        let (owner, repo) = (group(1)?, group(2)?);
        log::debug!("[{url}]: owner '{owner}', repo '{repo}'");

        Ok((owner, repo))
    }

    /// Looks up the repository the current working directory belongs to via the `origin` remote.
    pub fn find_owner_and_repo() -> anyhow::Result<(String, String)> {
        let url = git_remote_url("origin")?;
        parse_owner_repo(&url)
    }

    /// Picks the `rel="next"` target out of a GitHub `Link` response header.
    ///
    /// Example: `<https://api.github.com/user/repos?page=2>; rel="next", <https://api.github.com/user/repos?page=5>; rel="last"`
    pub fn next_page_link(link_header: &str) -> Option<String> {
        link_header.split(',').find_map(|entry| {
            let (target, params) = entry.split_once(';')?;
            let is_next = params
                .split(';')
                .map(str::trim)
                .any(|param| param == r#"rel="next""#);

            is_next.then(|| {
                target
                    .trim()
                    .trim_start_matches('<')
                    .trim_end_matches('>')
                    .to_string()
            })
        })
    }

}
