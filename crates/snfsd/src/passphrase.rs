//! Passphrase input: environment first, then an interactive prompt.

use anyhow::{bail, Context, Result};
use secrecy::{ExposeSecret, SecretString};

/// Passphrase for unlocking (and the current one for `passwd`)
pub const PASSPHRASE_ENV: &str = "SNFS_PASSPHRASE";
/// Replacement passphrase for `passwd`
pub const NEW_PASSPHRASE_ENV: &str = "SNFS_NEW_PASSPHRASE";

/// Read an existing passphrase.
pub fn current() -> Result<SecretString> {
    from_env_or_prompt(PASSPHRASE_ENV, "Passphrase: ")
}

/// Read a passphrase that is about to wrap the master key. Interactive input
/// is asked for twice.
pub fn new_for(env: &str) -> Result<SecretString> {
    if let Some(pw) = from_env(env) {
        return non_empty(pw);
    }
    let first = prompt("New passphrase: ")?;
    let second = prompt("Confirm passphrase: ")?;
    if first.expose_secret() != second.expose_secret() {
        bail!("passphrases do not match");
    }
    non_empty(first)
}

fn from_env_or_prompt(env: &str, text: &str) -> Result<SecretString> {
    match from_env(env) {
        Some(pw) => Ok(pw),
        None => prompt(text),
    }
}

fn from_env(env: &str) -> Option<SecretString> {
    std::env::var(env).ok().map(SecretString::from)
}

fn prompt(text: &str) -> Result<SecretString> {
    let pw = rpassword::prompt_password(text).context("reading passphrase from terminal")?;
    Ok(SecretString::from(pw))
}

fn non_empty(pw: SecretString) -> Result<SecretString> {
    if pw.expose_secret().is_empty() {
        bail!("passphrase must not be empty");
    }
    Ok(pw)
}
