use std::fs;
use std::io;
use std::path::Path;

use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, warn};

use crate::config::AppConfig;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CredentialSource {
    Environment,
    KeyFile,
}

impl CredentialSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialSource::Environment => "environment",
            CredentialSource::KeyFile => "key_file",
        }
    }
}

#[derive(Clone)]
pub struct Credential {
    secret: SecretString,
    source: CredentialSource,
}

impl Credential {
    fn new(secret: SecretString, source: CredentialSource) -> Self {
        Self { secret, source }
    }

    pub fn secret(&self) -> &SecretString {
        &self.secret
    }

    pub fn source(&self) -> CredentialSource {
        self.source
    }

    pub fn masked(&self) -> String {
        mask(self.secret.expose_secret())
    }
}

pub fn resolve_google_credential(config: &AppConfig) -> Option<Credential> {
    let from_env = config
        .google_key_env
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(|v| (v.to_string(), CredentialSource::Environment));
    let candidate = from_env.or_else(|| {
        read_key_file(&config.google_key_file).map(|v| (v, CredentialSource::KeyFile))
    });

    let Some((value, source)) = candidate else {
        warn!(
            target: "credentials",
            "no Google API key found; proceeding with OSM-only geocoding"
        );
        return None;
    };

    if !is_well_formed(&value) {
        warn!(
            target: "credentials",
            source = source.as_str(),
            "Google API key is malformed; proceeding with OSM-only geocoding"
        );
        return None;
    }

    let credential = Credential::new(SecretString::new(value.into()), source);
    debug!(
        target: "credentials",
        source = source.as_str(),
        key = %credential.masked(),
        "loaded Google API key"
    );
    Some(credential)
}

fn read_key_file(path: &Path) -> Option<String> {
    match fs::read_to_string(path) {
        Ok(contents) => Some(contents.trim().to_string()).filter(|v| !v.is_empty()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => None,
        Err(err) => {
            warn!(
                target: "credentials",
                path = %path.display(),
                error = %err,
                "unable to read key file"
            );
            None
        }
    }
}

fn is_well_formed(value: &str) -> bool {
    !value.is_empty() && value.chars().all(|ch| ch.is_ascii_graphic())
}

fn mask(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    if chars.len() <= 10 {
        return "*".repeat(chars.len());
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}...{tail}")
}
