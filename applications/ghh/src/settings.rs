use std::{
    io::Write,
    path::{Path, PathBuf},
};

use anyhow::{anyhow, bail, Context, Result};
use config::{Config, ConfigError, Environment, File, FileFormat};
use log::debug;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

/// Overrides the persisted token for every command.
pub const TOKEN_ENV_KEY: &str = "GHH_TOKEN";
const ENV_PREFIX: &str = "GHH";
const SETTINGS_DIRECTORY: &str = "ghh";
const SETTINGS_FILE: &str = "settings.json";
const NO_TOKEN: &str =
    "no token found. Please set the GHH_TOKEN environment variable or run `ghh set-auth`";

/// On-disk representation, `{"token": "<string>"}`.
#[derive(Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    pub token: String,
}

/// `<user-config-dir>/ghh/settings.json`
pub fn settings_path() -> Result<PathBuf> {
    let config_dir =
        dirs::config_dir().ok_or_else(|| anyhow!("couldn't determine the user config directory"))?;

    Ok(config_dir.join(SETTINGS_DIRECTORY).join(SETTINGS_FILE))
}

/// Writes the token next to `path` first and renames it into place, so a crash never leaves a
/// truncated settings file behind.
pub fn save_token(path: &Path, token: &str) -> Result<()> {
    let settings_dir = path
        .parent()
        .ok_or_else(|| anyhow!("{path:?} has no parent directory"))?;
    std::fs::create_dir_all(settings_dir).context(format!("creating {settings_dir:?}"))?;

    let json = serde_json::to_vec(&Settings {
        token: token.to_string(),
    })?;

    let mut tempfile = NamedTempFile::new_in(settings_dir)
        .context(format!("creating tempfile in {settings_dir:?}"))?;
    tempfile.write_all(&json)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(tempfile.path(), std::fs::Permissions::from_mode(0o600))
            .context(format!("restricting permissions of {:?}", tempfile.path()))?;
    }

    tempfile
        .persist(path)
        .map_err(|e| e.error)
        .context(format!("renaming tempfile to {path:?}"))?;

    debug!("wrote settings to {path:?}");

    Ok(())
}

/// Resolves the token from the settings file, overridden by `GHH_TOKEN`.
pub fn load_token(path: &Path) -> Result<String> {
    load_token_with_env(path, None)
}

/// Like [`load_token`], but reads the environment from `env` instead of the process when given.
pub fn load_token_with_env(
    path: &Path,
    env: Option<config::Map<String, String>>,
) -> Result<String> {
    let settings = Config::builder()
        .add_source(File::from(path).format(FileFormat::Json).required(false))
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .ignore_empty(true)
                .source(env),
        )
        .build()
        .context(format!("loading settings from {path:?}"))?;

    match settings.get_string("token") {
        Ok(token) if !token.is_empty() => Ok(token),
        Ok(_) | Err(ConfigError::NotFound(_)) => bail!(NO_TOKEN),
        Err(e) => Err(e).context(format!("reading token from {path:?}")),
    }
}

/// Shorthand for every command that needs to talk to GitHub.
pub fn get_token() -> Result<String> {
    load_token(&settings_path()?)
}

pub fn read_token_interactively() -> Result<String> {
    println!(
        "Please enter your GitHub personal access token or restart set-auth with the {TOKEN_ENV_KEY} environment variable set."
    );

    let token = dialoguer::Password::new()
        .with_prompt("Token")
        .interact()
        .context("reading token from terminal")?;

    Ok(token)
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use tempfile::tempdir;

    use super::{load_token_with_env, save_token, Settings, TOKEN_ENV_KEY};

    fn env(pairs: &[(&str, &str)]) -> Option<config::Map<String, String>> {
        Some(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    #[test]
    fn test_save_and_load_token() {
        let tempdir = tempdir().unwrap();
        let path = tempdir.path().join("ghh").join("settings.json");

        save_token(&path, "ghp_secret").unwrap();

        let written: Settings =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(
            written,
            Settings {
                token: "ghp_secret".to_string()
            }
        );
        assert_eq!(load_token_with_env(&path, env(&[])).unwrap(), "ghp_secret");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn test_env_overrides_file() {
        let tempdir = tempdir().unwrap();
        let path = tempdir.path().join("settings.json");
        save_token(&path, "from-file").unwrap();

        let token = load_token_with_env(&path, env(&[(TOKEN_ENV_KEY, "from-env")])).unwrap();
        assert_eq!(token, "from-env");

        // an empty variable doesn't shadow the file
        let token = load_token_with_env(&path, env(&[(TOKEN_ENV_KEY, "")])).unwrap();
        assert_eq!(token, "from-file");
    }

    #[test]
    fn test_missing_token() {
        let tempdir = tempdir().unwrap();
        let path = tempdir.path().join("settings.json");

        let err = load_token_with_env(&path, env(&[])).unwrap_err();
        assert!(err.to_string().starts_with("no token found"), "{err}");

        let token = load_token_with_env(&path, env(&[(TOKEN_ENV_KEY, "from-env")])).unwrap();
        assert_eq!(token, "from-env");
    }
}
