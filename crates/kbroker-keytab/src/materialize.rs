//! Keytab materialization
//!
//! Turning a `(principal, password)` pair into keytab bytes is platform
//! specific, so the cache only sees the [`KeytabMaterializer`] trait. The
//! implementation is chosen once at startup by [`detect_materializer`].
//!
//! | Kind            | Output                                          |
//! |-----------------|-------------------------------------------------|
//! | `ktutil`        | MIT keytab written by `ktutil`                  |
//! | `shared-secret` | The derived password itself                     |
//! | unsupported     | Always [`MaterializeError::Unsupported`]        |

use crate::error::MaterializeError;
use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Produces keytab bytes for a principal and password
#[async_trait]
pub trait KeytabMaterializer: Send + Sync + fmt::Debug {
    /// Short name for logs
    fn name(&self) -> &'static str;

    /// Build the credential blob
    ///
    /// The returned bytes are opaque to the caller.
    async fn materialize(
        &self,
        principal: &str,
        password: &SecretString,
    ) -> Result<Vec<u8>, MaterializeError>;
}

/// Which materializer to use
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MaterializerKind {
    /// `ktutil` when it is on `PATH`, otherwise unsupported
    #[default]
    Auto,
    /// Always `ktutil`
    Ktutil,
    /// The derived password is the credential
    SharedSecret,
}

/// Materializer settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaterializerConfig {
    /// Which implementation to use
    #[serde(default)]
    pub kind: MaterializerKind,

    /// `ktutil` binary, looked up on `PATH` when not a path
    #[serde(default = "default_ktutil_path")]
    pub ktutil_path: PathBuf,

    /// Key version number written into keytab entries
    #[serde(default = "default_kvno")]
    pub kvno: u32,

    /// Encryption types, one keytab entry each
    #[serde(default = "default_enctypes")]
    pub enctypes: Vec<String>,
}

fn default_ktutil_path() -> PathBuf {
    PathBuf::from("ktutil")
}

fn default_kvno() -> u32 {
    1
}

fn default_enctypes() -> Vec<String> {
    vec![
        "aes256-cts-hmac-sha1-96".to_string(),
        "aes128-cts-hmac-sha1-96".to_string(),
    ]
}

impl Default for MaterializerConfig {
    fn default() -> Self {
        Self {
            kind: MaterializerKind::default(),
            ktutil_path: default_ktutil_path(),
            kvno: default_kvno(),
            enctypes: default_enctypes(),
        }
    }
}

/// Pick the materializer for this host
///
/// # Errors
///
/// [`MaterializeError::Unsupported`] when `ktutil` is requested explicitly
/// but cannot be found, [`MaterializeError::InvalidInput`] for unusable
/// encryption types.
pub fn detect_materializer(
    config: &MaterializerConfig,
) -> Result<Arc<dyn KeytabMaterializer>, MaterializeError> {
    match config.kind {
        MaterializerKind::SharedSecret => {
            info!("using shared-secret keytab materializer");
            Ok(Arc::new(SharedSecretMaterializer))
        }
        MaterializerKind::Ktutil => {
            let program = find_executable(&config.ktutil_path).ok_or_else(|| {
                MaterializeError::Unsupported(format!(
                    "{} not found",
                    config.ktutil_path.display()
                ))
            })?;
            info!(program = %program.display(), "using ktutil keytab materializer");
            Ok(Arc::new(KtutilMaterializer::new(program, config.kvno, config.enctypes.clone())?))
        }
        MaterializerKind::Auto => match find_executable(&config.ktutil_path) {
            Some(program) => {
                info!(program = %program.display(), "detected ktutil");
                Ok(Arc::new(KtutilMaterializer::new(program, config.kvno, config.enctypes.clone())?))
            }
            None => {
                warn!(
                    program = %config.ktutil_path.display(),
                    "no keytab tool found, keytab requests will fail"
                );
                Ok(Arc::new(UnsupportedMaterializer::new(format!(
                    "{} not found on this host",
                    config.ktutil_path.display()
                ))))
            }
        },
    }
}

fn find_executable(program: &Path) -> Option<PathBuf> {
    if program.components().count() > 1 {
        return program.is_file().then(|| program.to_path_buf());
    }
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
}

/// Writes MIT keytabs with `ktutil`
#[derive(Debug, Clone)]
pub struct KtutilMaterializer {
    program: PathBuf,
    kvno: u32,
    enctypes: Vec<String>,
}

impl KtutilMaterializer {
    /// Create a materializer driving `program`
    ///
    /// # Errors
    ///
    /// [`MaterializeError::InvalidInput`] when no encryption types are given
    /// or one of them is not a plain `[a-z0-9-]` name.
    pub fn new(
        program: impl Into<PathBuf>,
        kvno: u32,
        enctypes: Vec<String>,
    ) -> Result<Self, MaterializeError> {
        if enctypes.is_empty() {
            return Err(MaterializeError::InvalidInput("no encryption types".to_string()));
        }
        if let Some(bad) = enctypes.iter().find(|e| !is_plain_token(e)) {
            return Err(MaterializeError::InvalidInput(format!("encryption type '{bad}'")));
        }
        Ok(Self {
            program: program.into(),
            kvno,
            enctypes,
        })
    }

    /// The ktutil command script; holds the password
    fn script(&self, principal: &str, password: &SecretString, keytab: &Path) -> SecretString {
        let mut script = String::new();
        for enctype in &self.enctypes {
            script.push_str(&format!(
                "addent -password -p {principal} -k {} -e {enctype}\n",
                self.kvno
            ));
            script.push_str(password.expose_secret());
            script.push('\n');
        }
        script.push_str(&format!("wkt {}\n", keytab.display()));
        script.push_str("quit\n");
        SecretString::new(script)
    }
}

fn is_plain_token(value: &str) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

#[async_trait]
impl KeytabMaterializer for KtutilMaterializer {
    fn name(&self) -> &'static str {
        "ktutil"
    }

    async fn materialize(
        &self,
        principal: &str,
        password: &SecretString,
    ) -> Result<Vec<u8>, MaterializeError> {
        // ktutil reads commands line by line
        if principal.is_empty() || principal.chars().any(char::is_whitespace) {
            return Err(MaterializeError::InvalidInput(format!("principal '{principal}'")));
        }
        if password.expose_secret().contains(['\n', '\r']) {
            return Err(MaterializeError::InvalidInput("password contains a line break".to_string()));
        }

        let dir = tempfile::tempdir()?;
        let keytab = dir.path().join("generated.keytab");
        let script = self.script(principal, password, &keytab);

        let mut child = Command::new(&self.program)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| MaterializeError::Io("ktutil stdin unavailable".to_string()))?;
        stdin.write_all(script.expose_secret().as_bytes()).await?;
        drop(stdin);

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(MaterializeError::Tool {
                tool: self.program.display().to_string(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let bytes = tokio::fs::read(&keytab).await?;
        if bytes.is_empty() {
            return Err(MaterializeError::Tool {
                tool: self.program.display().to_string(),
                status: output.status.to_string(),
                stderr: "empty keytab written".to_string(),
            });
        }

        debug!(principal, entries = self.enctypes.len(), bytes = bytes.len(), "keytab written");
        Ok(bytes)
    }
}

/// Uses the derived password as the credential
///
/// For services that authenticate with a shared secret rather than a
/// keytab.
#[derive(Debug, Clone, Copy, Default)]
pub struct SharedSecretMaterializer;

#[async_trait]
impl KeytabMaterializer for SharedSecretMaterializer {
    fn name(&self) -> &'static str {
        "shared-secret"
    }

    async fn materialize(
        &self,
        _principal: &str,
        password: &SecretString,
    ) -> Result<Vec<u8>, MaterializeError> {
        Ok(password.expose_secret().as_bytes().to_vec())
    }
}

/// Fails every request
///
/// Selected when the host has no way to produce keytabs, so that requests
/// get a clear error rather than a blob that looks usable.
#[derive(Debug, Clone)]
pub struct UnsupportedMaterializer {
    reason: String,
}

impl UnsupportedMaterializer {
    /// Create a materializer failing with `reason`
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl KeytabMaterializer for UnsupportedMaterializer {
    fn name(&self) -> &'static str {
        "unsupported"
    }

    async fn materialize(
        &self,
        _principal: &str,
        _password: &SecretString,
    ) -> Result<Vec<u8>, MaterializeError> {
        Err(MaterializeError::Unsupported(self.reason.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn password() -> SecretString {
        SecretString::new("s3cretPassw0rd_s3cretPassw0rd_a!".to_string())
    }

    #[tokio::test]
    async fn test_shared_secret_returns_password() {
        let bytes = SharedSecretMaterializer
            .materialize("alice@EX.COM", &password())
            .await
            .unwrap();
        assert_eq!(bytes, b"s3cretPassw0rd_s3cretPassw0rd_a!".to_vec());
    }

    #[tokio::test]
    async fn test_unsupported_always_fails() {
        let err = UnsupportedMaterializer::new("no ktutil")
            .materialize("alice@EX.COM", &password())
            .await
            .unwrap_err();
        assert_eq!(err, MaterializeError::Unsupported("no ktutil".to_string()));
    }

    #[test]
    fn test_ktutil_script() {
        let ktutil = KtutilMaterializer::new(
            "ktutil",
            3,
            vec!["aes256-cts-hmac-sha1-96".to_string(), "aes128-cts-hmac-sha1-96".to_string()],
        )
        .unwrap();
        let script = ktutil.script("alice@EX.COM", &password(), Path::new("/tmp/k/generated.keytab"));

        assert_eq!(
            script.expose_secret(),
            "addent -password -p alice@EX.COM -k 3 -e aes256-cts-hmac-sha1-96\n\
             s3cretPassw0rd_s3cretPassw0rd_a!\n\
             addent -password -p alice@EX.COM -k 3 -e aes128-cts-hmac-sha1-96\n\
             s3cretPassw0rd_s3cretPassw0rd_a!\n\
             wkt /tmp/k/generated.keytab\n\
             quit\n"
        );
    }

    #[test]
    fn test_ktutil_rejects_odd_enctypes() {
        assert!(KtutilMaterializer::new("ktutil", 1, vec![]).is_err());
        assert!(KtutilMaterializer::new("ktutil", 1, vec!["aes256\nwkt /etc/krb5.keytab".to_string()]).is_err());
    }

    #[tokio::test]
    async fn test_ktutil_rejects_multiline_principal() {
        let ktutil = KtutilMaterializer::new("ktutil", 1, default_enctypes()).unwrap();
        let err = ktutil
            .materialize("alice@EX.COM\nwkt /etc/krb5.keytab", &password())
            .await
            .unwrap_err();
        assert!(matches!(err, MaterializeError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_missing_binary_is_io_error() {
        let ktutil =
            KtutilMaterializer::new("/nonexistent/bin/ktutil", 1, default_enctypes()).unwrap();
        let err = ktutil.materialize("alice@EX.COM", &password()).await.unwrap_err();
        assert!(matches!(err, MaterializeError::Io(_)));
    }

    #[test]
    fn test_detection() {
        let shared = detect_materializer(&MaterializerConfig {
            kind: MaterializerKind::SharedSecret,
            ..MaterializerConfig::default()
        })
        .unwrap();
        assert_eq!(shared.name(), "shared-secret");

        let missing = MaterializerConfig {
            ktutil_path: PathBuf::from("definitely-not-a-real-ktutil"),
            ..MaterializerConfig::default()
        };
        assert_eq!(detect_materializer(&missing).unwrap().name(), "unsupported");
        assert!(matches!(
            detect_materializer(&MaterializerConfig {
                kind: MaterializerKind::Ktutil,
                ..missing
            }),
            Err(MaterializeError::Unsupported(_))
        ));
    }

    #[test]
    fn test_kind_serde() {
        let kind: MaterializerKind = serde_json::from_str("\"shared-secret\"").unwrap();
        assert_eq!(kind, MaterializerKind::SharedSecret);
    }
}
