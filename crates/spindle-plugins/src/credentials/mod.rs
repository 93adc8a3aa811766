//! Credential resolution at the plugin boundary.
//!
//! Credentials are stored elsewhere; the manager only sees them through a
//! [`CredentialResolver`]. Resolved values feed the launch environment of a
//! plugin (`SPINDLE_CREDENTIAL_<FIELD>`) and the `Authorization` header of
//! forwarded calls. They are never kept beyond one launch or call.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::Deserialize;

use crate::error::PluginError;

/// Prefix of environment variables carrying credential fields.
pub const CREDENTIAL_ENV_PREFIX: &str = "SPINDLE_CREDENTIAL_";

/// A secret string whose `Debug` output is redacted.
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    /// Wraps a secret value.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The secret value.
    #[must_use]
    pub const fn expose(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// Identity on whose behalf a call is made.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requester {
    /// Stable requester identifier.
    pub id: String,
    /// Access token presented by the requester, if any.
    pub access_token: Option<Secret>,
}

impl Requester {
    /// Creates a requester without an access token.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            access_token: None,
        }
    }

    /// Attaches an access token.
    #[must_use]
    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(Secret::new(token));
        self
    }
}

/// Typed credential shapes understood by the manager.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CredentialFields {
    /// `Authorization: Bearer <token>`.
    BearerAuth {
        /// Bearer token.
        token: Secret,
    },
    /// `Authorization: Basic base64(<username>:<password>)`.
    BasicAuth {
        /// User name.
        username: String,
        /// Password.
        password: Secret,
    },
    /// GitHub personal access token, sent as a bearer token.
    GithubPat {
        /// GitHub server, for enterprise installations.
        #[serde(default)]
        server: Option<String>,
        /// Account the token belongs to.
        #[serde(default)]
        user: Option<String>,
        /// Access token.
        token: Secret,
    },
    /// GitLab personal access token, sent as a bearer token.
    GitlabPat {
        /// Access token.
        token: Secret,
    },
    /// SSH key for fetching sources. Not applicable to HTTP calls.
    SshKey {
        /// Private key material.
        private_key: Secret,
        /// Key passphrase.
        #[serde(default)]
        passphrase: Option<Secret>,
    },
    /// Forward the requester's own access token as a bearer token.
    RequesterToken,
}

impl CredentialFields {
    /// Canonical type name.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::BearerAuth { .. } => "bearer_auth",
            Self::BasicAuth { .. } => "basic_auth",
            Self::GithubPat { .. } => "github_pat",
            Self::GitlabPat { .. } => "gitlab_pat",
            Self::SshKey { .. } => "ssh_key",
            Self::RequesterToken => "requester_token",
        }
    }

    fn env_fields(&self) -> Vec<(&'static str, &str)> {
        match self {
            Self::BearerAuth { token } | Self::GitlabPat { token } => {
                vec![("TOKEN", token.expose())]
            }
            Self::BasicAuth { username, password } => vec![
                ("USERNAME", username.as_str()),
                ("PASSWORD", password.expose()),
            ],
            Self::GithubPat {
                server,
                user,
                token,
            } => {
                let mut fields = vec![("TOKEN", token.expose())];
                if let Some(server) = server {
                    fields.push(("SERVER", server.as_str()));
                }
                if let Some(user) = user {
                    fields.push(("USER", user.as_str()));
                }
                fields
            }
            Self::SshKey {
                private_key,
                passphrase,
            } => {
                let mut fields = vec![("PRIVATE_KEY", private_key.expose())];
                if let Some(passphrase) = passphrase {
                    fields.push(("PASSPHRASE", passphrase.expose()));
                }
                fields
            }
            Self::RequesterToken => Vec::new(),
        }
    }
}

/// A credential resolved for one launch or call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedCredential {
    /// Reference the credential was resolved from.
    pub reference: String,
    /// Typed fields.
    pub fields: CredentialFields,
    /// Fields outside the typed shape, passed through to the environment.
    pub extra: BTreeMap<String, Secret>,
}

impl ResolvedCredential {
    /// Creates a credential with no extra fields.
    #[must_use]
    pub fn new(reference: impl Into<String>, fields: CredentialFields) -> Self {
        Self {
            reference: reference.into(),
            fields,
            extra: BTreeMap::new(),
        }
    }

    /// Adds an untyped field.
    #[must_use]
    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.insert(key.into(), Secret::new(value));
        self
    }

    /// Environment variables handed to the plugin process.
    #[must_use]
    pub fn launch_env(&self) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        env.insert(
            format!("{CREDENTIAL_ENV_PREFIX}TYPE"),
            self.fields.kind().to_owned(),
        );
        for (key, value) in &self.extra {
            env.insert(env_key(key), value.expose().to_owned());
        }
        for (field, value) in self.fields.env_fields() {
            env.insert(format!("{CREDENTIAL_ENV_PREFIX}{field}"), value.to_owned());
        }
        env
    }

    /// `Authorization` header value for a call made by `requester`.
    ///
    /// Returns `Ok(None)` for credentials that do not apply to HTTP.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::CredentialAccessDenied`] when the credential
    /// forwards the requester token and the requester has none.
    pub fn authorization(
        &self,
        requester: Option<&Requester>,
    ) -> Result<Option<Secret>, PluginError> {
        let value = match &self.fields {
            CredentialFields::BearerAuth { token }
            | CredentialFields::GitlabPat { token }
            | CredentialFields::GithubPat { token, .. } => format!("Bearer {}", token.expose()),
            CredentialFields::BasicAuth { username, password } => {
                let pair = format!("{username}:{}", password.expose());
                format!("Basic {}", STANDARD.encode(pair.as_bytes()))
            }
            CredentialFields::SshKey { .. } => return Ok(None),
            CredentialFields::RequesterToken => {
                let token = requester
                    .and_then(|requester| requester.access_token.as_ref())
                    .ok_or_else(|| PluginError::CredentialAccessDenied {
                        reference: self.reference.clone(),
                    })?;
                format!("Bearer {}", token.expose())
            }
        };
        Ok(Some(Secret::new(value)))
    }
}

fn env_key(key: &str) -> String {
    let normalised: String = key
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("{CREDENTIAL_ENV_PREFIX}{normalised}")
}

/// Looks up credentials by reference on behalf of a requester.
#[async_trait]
pub trait CredentialResolver: Send + Sync {
    /// Resolves `reference` for `requester`.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::CredentialNotFound`] or
    /// [`PluginError::CredentialAccessDenied`].
    async fn resolve(
        &self,
        reference: &str,
        requester: Option<&Requester>,
    ) -> Result<ResolvedCredential, PluginError>;
}

/// Resolver for deployments without credentials: every lookup fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCredentials;

#[async_trait]
impl CredentialResolver for NoCredentials {
    async fn resolve(
        &self,
        reference: &str,
        _requester: Option<&Requester>,
    ) -> Result<ResolvedCredential, PluginError> {
        Err(PluginError::CredentialNotFound {
            reference: reference.to_owned(),
        })
    }
}

#[derive(Debug, Clone)]
struct StaticEntry {
    credential: ResolvedCredential,
    allowed: Option<HashSet<String>>,
}

/// In-memory resolver with optional per-requester access lists.
#[derive(Debug, Default, Clone)]
pub struct StaticCredentials {
    entries: HashMap<String, StaticEntry>,
}

impl StaticCredentials {
    /// Creates an empty resolver.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a credential usable by anyone.
    #[must_use]
    pub fn with(mut self, credential: ResolvedCredential) -> Self {
        self.entries.insert(
            credential.reference.clone(),
            StaticEntry {
                credential,
                allowed: None,
            },
        );
        self
    }

    /// Adds a credential usable only by the listed requester ids.
    #[must_use]
    pub fn with_restricted<I, S>(mut self, credential: ResolvedCredential, allowed: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.entries.insert(
            credential.reference.clone(),
            StaticEntry {
                credential,
                allowed: Some(allowed.into_iter().map(Into::into).collect()),
            },
        );
        self
    }
}

#[async_trait]
impl CredentialResolver for StaticCredentials {
    async fn resolve(
        &self,
        reference: &str,
        requester: Option<&Requester>,
    ) -> Result<ResolvedCredential, PluginError> {
        let entry = self
            .entries
            .get(reference)
            .ok_or_else(|| PluginError::CredentialNotFound {
                reference: reference.to_owned(),
            })?;
        if let Some(allowed) = &entry.allowed {
            let permitted = requester.is_some_and(|requester| allowed.contains(&requester.id));
            if !permitted {
                return Err(PluginError::CredentialAccessDenied {
                    reference: reference.to_owned(),
                });
            }
        }
        Ok(entry.credential.clone())
    }
}
