//! Secret store: turns a stored ciphertext into the plaintext SSH secret.
//!
//! The daemon never holds key material itself. Decryption is delegated to an
//! operator-supplied command that reads the ciphertext on stdin and writes the
//! plaintext to stdout.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncWriteExt;

#[derive(Debug, Error)]
pub enum SecretError {
    /// The ciphertext cannot be decrypted. Retrying will not help.
    #[error("secret rejected: {0}")]
    Invalid(String),
    /// The decryptor could not be reached this time.
    #[error("secret store unavailable: {0}")]
    Unavailable(#[source] anyhow::Error),
}

#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn decrypt(&self, ciphertext: &str) -> Result<String, SecretError>;
}

/// Runs `program args...` once per decryption.
#[derive(Debug, Clone)]
pub struct CommandSecretStore {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandSecretStore {
    pub fn new(program: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            timeout,
        }
    }

    async fn run(&self, ciphertext: &str) -> Result<String, SecretError> {
        let mut child = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SecretError::Unavailable(anyhow::anyhow!("spawn {}: {e}", self.program)))?;

        if let Some(mut stdin) = child.stdin.take() {
            match stdin.write_all(ciphertext.as_bytes()).await {
                // A decryptor that exits early is judged by its exit status.
                Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {}
                Err(e) => return Err(SecretError::Unavailable(e.into())),
                Ok(()) => {}
            }
            // Dropping stdin closes the pipe so the decryptor sees EOF.
        }

        let out = child
            .wait_with_output()
            .await
            .map_err(|e| SecretError::Unavailable(e.into()))?;

        if !out.status.success() {
            return Err(SecretError::Invalid(format!(
                "{} exited with {}: {}",
                self.program,
                out.status,
                String::from_utf8_lossy(&out.stderr).trim()
            )));
        }

        let plaintext = String::from_utf8(out.stdout)
            .map_err(|_| SecretError::Invalid("decrypted secret is not valid UTF-8".into()))?;
        let plaintext = plaintext
            .strip_suffix('\n')
            .map(|s| s.strip_suffix('\r').unwrap_or(s))
            .unwrap_or(&plaintext)
            .to_string();
        if plaintext.is_empty() {
            return Err(SecretError::Invalid("decrypted secret is empty".into()));
        }
        Ok(plaintext)
    }
}

#[async_trait]
impl SecretStore for CommandSecretStore {
    async fn decrypt(&self, ciphertext: &str) -> Result<String, SecretError> {
        match tokio::time::timeout(self.timeout, self.run(ciphertext)).await {
            Ok(res) => res,
            Err(_) => Err(SecretError::Unavailable(anyhow::anyhow!(
                "{} timed out after {:?}",
                self.program,
                self.timeout
            ))),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn store(program: &str, args: &[&str]) -> CommandSecretStore {
        CommandSecretStore::new(
            program,
            args.iter().map(|s| s.to_string()).collect(),
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn test_decrypt_echoes_stdout_without_trailing_newline() {
        let s = store("sh", &["-c", "cat; echo"]);
        assert_eq!(s.decrypt("hunter2").await.unwrap(), "hunter2");
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_invalid() {
        let s = store("sh", &["-c", "cat >/dev/null; echo bad key >&2; exit 3"]);
        let err = s.decrypt("x").await.unwrap_err();
        assert!(matches!(err, SecretError::Invalid(ref m) if m.contains("bad key")), "{err}");
    }

    #[tokio::test]
    async fn test_missing_program_is_unavailable() {
        let s = store("/nonexistent/relay-decrypt", &[]);
        assert!(matches!(
            s.decrypt("x").await,
            Err(SecretError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_timeout_is_unavailable() {
        let s = CommandSecretStore::new(
            "sh",
            vec!["-c".into(), "sleep 5".into()],
            Duration::from_millis(100),
        );
        assert!(matches!(
            s.decrypt("x").await,
            Err(SecretError::Unavailable(_))
        ));
    }
}
