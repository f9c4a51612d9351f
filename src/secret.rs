//! Passphrase and encrypted-key acquisition.
//!
//! Everything downstream depends on [`SecretProvider`] only; which channel is
//! used comes from the `[secret]` table of the config.

use crate::error::{Error, Result};

use openssl::pkey::{PKey, Private};
use serde::Deserialize;
use std::{
    fmt, fs,
    io::{self, BufRead},
    path::{Path, PathBuf},
};
use tracing::info;

/// Passphrase plus the (usually encrypted) PEM key it unlocks.
#[derive(Clone)]
pub struct SecretMaterial {
    pub passphrase: String,
    pub key_pem:    String,
}

impl fmt::Debug for SecretMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretMaterial").finish_non_exhaustive()
    }
}

impl SecretMaterial {
    /// An unencrypted key loads regardless of the passphrase.
    pub fn unlock(&self) -> Result<PKey<Private>> {
        PKey::private_key_from_pem_passphrase(self.key_pem.as_bytes(), self.passphrase.as_bytes())
            .map_err(|e| Error::KeyMaterial(format!("cannot decrypt private key: {e}")))
    }
}

pub trait SecretProvider {
    fn acquire(&mut self) -> Result<SecretMaterial>;
}

/// First line is the passphrase, the rest up to EOF is the key (`certserver < secret.txt`).
pub struct RedirectedSecret<R> {
    input: R,
}

impl<R: BufRead> RedirectedSecret<R> {
    pub fn new(input: R) -> Self {
        RedirectedSecret { input }
    }
}

impl<R: BufRead> SecretProvider for RedirectedSecret<R> {
    fn acquire(&mut self) -> Result<SecretMaterial> {
        let mut passphrase = String::new();
        self.input.read_line(&mut passphrase)?;
        let passphrase = passphrase.trim_end_matches(['\r', '\n']).to_string();

        let mut key_pem = String::new();
        for line in (&mut self.input).lines() {
            key_pem.push_str(&line?);
            key_pem.push('\n');
        }
        if key_pem.trim().is_empty() {
            return Err(Error::KeyMaterial("no key received on redirected input".into()));
        }

        info!("passphrase and key entered by redirection");
        Ok(SecretMaterial { passphrase, key_pem })
    }
}

/// Passphrase file (`ssl.pass`) next to the encrypted key file.
pub struct FileSecret {
    pass_file: PathBuf,
    key_file:  PathBuf,
}

impl FileSecret {
    pub fn new(pass_file: impl Into<PathBuf>, key_file: impl Into<PathBuf>) -> Self {
        FileSecret { pass_file: pass_file.into(), key_file: key_file.into() }
    }
}

impl SecretProvider for FileSecret {
    fn acquire(&mut self) -> Result<SecretMaterial> {
        let passphrase = read_secret_file(&self.pass_file)?
            .replace(['\r', '\n'], "");
        let key_pem = read_secret_file(&self.key_file)?;
        Ok(SecretMaterial { passphrase, key_pem })
    }
}

/// Masked terminal prompt for the passphrase; the key is read from disk.
pub struct PromptSecret {
    key_file: PathBuf,
}

impl PromptSecret {
    pub fn new(key_file: impl Into<PathBuf>) -> Self {
        PromptSecret { key_file: key_file.into() }
    }
}

impl SecretProvider for PromptSecret {
    fn acquire(&mut self) -> Result<SecretMaterial> {
        let passphrase = rpassword::prompt_password("Enter passphrase: ")
            .map_err(|e| Error::KeyMaterial(format!("reading passphrase: {e}")))?;
        let key_pem = read_secret_file(&self.key_file)?;
        Ok(SecretMaterial { passphrase, key_pem })
    }
}

fn read_secret_file(path: &Path) -> Result<String> {
    fs::read_to_string(path)
        .map_err(|e| Error::KeyMaterial(format!("reading `{}`: {e}", path.display())))
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum SecretConfig {
    Stdin,
    File {
        #[serde(default)]
        pass_file: Option<PathBuf>,
    },
    Prompt,
}

impl SecretConfig {
    /// `key_file` is where the encrypted key lives for the file and prompt channels;
    /// `default_pass_file` is used when the file channel names none.
    pub fn provider(&self, key_file: &Path, default_pass_file: &Path) -> Box<dyn SecretProvider> {
        match self {
            SecretConfig::Stdin => Box::new(RedirectedSecret::new(io::stdin().lock())),
            SecretConfig::File { pass_file } => Box::new(FileSecret::new(
                pass_file.as_deref().unwrap_or(default_pass_file),
                key_file,
            )),
            SecretConfig::Prompt => Box::new(PromptSecret::new(key_file)),
        }
    }
}
