//! Scoped access to externally stored secrets.
//!
//! A [`CredentialScope`] resolves a secret for the duration of one block of
//! work. The [`CredentialBindings`] handed to that block are cleared when the
//! scope drops, so a handle that escapes the block reads nothing afterwards.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use serde::Deserialize;
use tracing::debug;

use crate::error::{PipelineError, Result};

pub const ENV_PREFIX: &str = "SHIPYARD_CREDENTIAL_";

#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

#[derive(Debug, Clone)]
pub struct Credential {
    pub id: String,
    pub username: Option<String>,
    pub secret: Secret,
}

pub trait CredentialStore: Send + Sync {
    fn resolve(&self, id: &str) -> Result<Credential>;
}

/// Credentials supplied through `SHIPYARD_CREDENTIAL_<ID>` variables, with an
/// optional `SHIPYARD_CREDENTIAL_<ID>_USERNAME`.
#[derive(Debug, Clone, Default)]
pub struct EnvCredentialStore {
    vars: HashMap<String, String>,
}

impl EnvCredentialStore {
    pub fn from_env() -> Self {
        Self::from_vars(std::env::vars())
    }

    pub fn from_vars<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let vars = vars
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .filter(|(k, _)| k.starts_with(ENV_PREFIX))
            .collect();
        Self { vars }
    }

    pub fn variable_name(id: &str) -> String {
        let normalized: String = id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect();
        format!("{ENV_PREFIX}{normalized}")
    }
}

impl CredentialStore for EnvCredentialStore {
    fn resolve(&self, id: &str) -> Result<Credential> {
        let key = Self::variable_name(id);
        let secret = self
            .vars
            .get(&key)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| PipelineError::Credential {
                id: id.to_string(),
                reason: format!("environment variable {key} is not set"),
            })?;
        Ok(Credential {
            id: id.to_string(),
            username: self.vars.get(&format!("{key}_USERNAME")).cloned(),
            secret: Secret::new(secret.clone()),
        })
    }
}

#[derive(Debug, Deserialize)]
struct CredentialFile {
    credentials: HashMap<String, CredentialFileEntry>,
}

#[derive(Debug, Deserialize)]
struct CredentialFileEntry {
    #[serde(default)]
    username: Option<String>,
    secret_file: PathBuf,
}

/// Credentials listed in a YAML index; each secret lives in its own file and
/// is only read when a scope asks for it.
#[derive(Debug)]
pub struct FileCredentialStore {
    base: PathBuf,
    entries: HashMap<String, CredentialFileEntry>,
}

impl FileCredentialStore {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|err| {
            PipelineError::io(
                format!("failed to read credential index {}", path.display()),
                err,
            )
        })?;
        let index: CredentialFile = serde_yaml::from_str(&content).map_err(|err| {
            PipelineError::Config(format!(
                "invalid credential index {}: {err}",
                path.display()
            ))
        })?;
        Ok(Self {
            base: path.parent().map(Path::to_path_buf).unwrap_or_default(),
            entries: index.credentials,
        })
    }
}

impl CredentialStore for FileCredentialStore {
    fn resolve(&self, id: &str) -> Result<Credential> {
        let entry = self.entries.get(id).ok_or_else(|| PipelineError::Credential {
            id: id.to_string(),
            reason: "not listed in credential index".into(),
        })?;
        let path = self.base.join(&entry.secret_file);
        let secret = fs::read_to_string(&path).map_err(|err| PipelineError::Credential {
            id: id.to_string(),
            reason: format!("cannot read {}: {err}", path.display()),
        })?;
        Ok(Credential {
            id: id.to_string(),
            username: entry.username.clone(),
            secret: Secret::new(secret.trim_end_matches(['\r', '\n'])),
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct StaticCredentialStore {
    entries: HashMap<String, Credential>,
}

impl StaticCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, id: &str, username: Option<&str>, secret: &str) -> Self {
        self.entries.insert(
            id.to_string(),
            Credential {
                id: id.to_string(),
                username: username.map(str::to_string),
                secret: Secret::new(secret),
            },
        );
        self
    }
}

impl CredentialStore for StaticCredentialStore {
    fn resolve(&self, id: &str) -> Result<Credential> {
        self.entries
            .get(id)
            .cloned()
            .ok_or_else(|| PipelineError::Credential {
                id: id.to_string(),
                reason: "unknown credential".into(),
            })
    }
}

/// Read handle onto an active scope.
#[derive(Clone)]
pub struct CredentialBindings {
    id: String,
    slot: Arc<RwLock<Option<Credential>>>,
}

impl CredentialBindings {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_active(&self) -> bool {
        self.slot
            .read()
            .map(|guard| guard.is_some())
            .unwrap_or(false)
    }

    pub fn secret(&self) -> Result<Secret> {
        self.read(|credential| credential.secret.clone())
    }

    pub fn username(&self) -> Result<Option<String>> {
        self.read(|credential| credential.username.clone())
    }

    /// Secret (and optionally username) as environment pairs for a tool.
    pub fn env(
        &self,
        secret_var: &str,
        username_var: Option<&str>,
    ) -> Result<Vec<(String, String)>> {
        self.read(|credential| {
            let mut vars = vec![(
                secret_var.to_string(),
                credential.secret.expose().to_string(),
            )];
            if let (Some(var), Some(user)) = (username_var, &credential.username) {
                vars.push((var.to_string(), user.clone()));
            }
            vars
        })
    }

    fn read<T>(&self, f: impl FnOnce(&Credential) -> T) -> Result<T> {
        let guard = self.slot.read().unwrap_or_else(|e| e.into_inner());
        guard.as_ref().map(f).ok_or_else(|| PipelineError::Credential {
            id: self.id.clone(),
            reason: "credential scope has been released".into(),
        })
    }
}

impl fmt::Debug for CredentialBindings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialBindings")
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}

pub struct CredentialScope {
    bindings: CredentialBindings,
}

impl CredentialScope {
    pub fn acquire(store: &dyn CredentialStore, id: &str) -> Result<Self> {
        let credential = store.resolve(id)?;
        debug!(credential = id, "Credential scope acquired");
        Ok(Self {
            bindings: CredentialBindings {
                id: id.to_string(),
                slot: Arc::new(RwLock::new(Some(credential))),
            },
        })
    }

    pub fn bindings(&self) -> &CredentialBindings {
        &self.bindings
    }
}

impl Drop for CredentialScope {
    fn drop(&mut self) {
        let mut guard = self
            .bindings
            .slot
            .write()
            .unwrap_or_else(|e| e.into_inner());
        guard.take();
        debug!(credential = self.bindings.id.as_str(), "Credential scope released");
    }
}

/// Runs `body` with `id` in scope; the bindings are released on every exit
/// path before the result is returned.
pub fn with_credential<T, F>(store: &dyn CredentialStore, id: &str, body: F) -> Result<T>
where
    F: FnOnce(&CredentialBindings) -> Result<T>,
{
    let scope = CredentialScope::acquire(store, id)?;
    let result = body(scope.bindings());
    drop(scope);
    result
}

/// Nested scopes for several credentials, released innermost first.
pub fn with_credentials<T, F>(store: &dyn CredentialStore, ids: &[&str], body: F) -> Result<T>
where
    F: FnOnce(&[CredentialBindings]) -> Result<T>,
{
    let mut stack = ScopeStack::default();
    for id in ids {
        stack.0.push(CredentialScope::acquire(store, id)?);
    }
    let bindings: Vec<CredentialBindings> =
        stack.0.iter().map(|scope| scope.bindings().clone()).collect();
    body(&bindings)
}

#[derive(Default)]
struct ScopeStack(Vec<CredentialScope>);

impl Drop for ScopeStack {
    fn drop(&mut self) {
        while let Some(scope) = self.0.pop() {
            drop(scope);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    fn store() -> StaticCredentialStore {
        StaticCredentialStore::new()
            .with("docker-cred", Some("asa96"), "registry-token")
            .with("github", None, "gh-token")
    }

    #[test]
    fn bindings_are_unreadable_after_block_returns() {
        let escaped = RefCell::new(None);
        let value = with_credential(&store(), "docker-cred", |bindings| {
            escaped.replace(Some(bindings.clone()));
            Ok(bindings.secret()?.expose().to_string())
        })
        .unwrap();
        assert_eq!(value, "registry-token");

        let escaped = escaped.into_inner().unwrap();
        assert!(!escaped.is_active());
        assert!(escaped.secret().is_err());
    }

    #[test]
    fn bindings_are_released_when_body_fails() {
        let escaped = RefCell::new(None);
        let result: Result<()> = with_credential(&store(), "github", |bindings| {
            escaped.replace(Some(bindings.clone()));
            Err(PipelineError::Build("exit status 1".into()))
        });
        assert!(matches!(result, Err(PipelineError::Build(_))));
        assert!(!escaped.into_inner().unwrap().is_active());
    }

    #[test]
    fn nested_scopes_release_inner_first() {
        let outer_handle = RefCell::new(None);
        with_credential(&store(), "docker-cred", |outer| {
            outer_handle.replace(Some(outer.clone()));
            let inner = with_credential(&store(), "github", |inner| Ok(inner.clone()))?;
            assert!(!inner.is_active());
            assert!(outer.is_active());
            Ok(())
        })
        .unwrap();
        assert!(!outer_handle.into_inner().unwrap().is_active());
    }

    #[test]
    fn with_credentials_releases_all_on_failure() {
        let escaped = RefCell::new(Vec::new());
        let result: Result<()> = with_credentials(&store(), &["docker-cred", "github"], |all| {
            escaped.replace(all.to_vec());
            Err(PipelineError::Config("boom".into()))
        });
        assert!(result.is_err());
        assert!(escaped.into_inner().iter().all(|b| !b.is_active()));
    }

    #[test]
    fn unknown_credential_is_reported() {
        let err = with_credential(&store(), "sonar-token", |_| Ok(())).unwrap_err();
        assert_eq!(err.kind(), "CredentialError");
    }

    #[test]
    fn env_store_reads_prefixed_variables() {
        let store = EnvCredentialStore::from_vars([
            ("SHIPYARD_CREDENTIAL_DOCKER_CRED", "token"),
            ("SHIPYARD_CREDENTIAL_DOCKER_CRED_USERNAME", "asa96"),
            ("HOME", "/root"),
        ]);
        let credential = store.resolve("docker-cred").unwrap();
        assert_eq!(credential.secret.expose(), "token");
        assert_eq!(credential.username.as_deref(), Some("asa96"));
        assert!(store.resolve("github").is_err());
    }

    #[test]
    fn file_store_reads_secret_files() {
        let temp = tempfile::tempdir().unwrap();
        fs::write(temp.path().join("sonar.txt"), "squ_abc\n").unwrap();
        fs::write(
            temp.path().join("credentials.yaml"),
            "credentials:\n  sonar-token:\n    secret_file: sonar.txt\n",
        )
        .unwrap();
        let store = FileCredentialStore::load(&temp.path().join("credentials.yaml")).unwrap();
        assert_eq!(store.resolve("sonar-token").unwrap().secret.expose(), "squ_abc");
    }

    #[test]
    fn secret_debug_is_redacted() {
        assert_eq!(format!("{:?}", Secret::new("abc")), "Secret(***)");
    }
}
