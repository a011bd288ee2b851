// SPDX-License-Identifier: PMPL-1.0-or-later

//! SSH credential resolution.
//!
//! Instance-level login material from the catalog is merged with the global
//! defaults from configuration. Precedence, highest first:
//!
//! - username: instance, global default, `root`
//! - private key: instance, global key, none
//! - password: instance only (a global password is never applied)
//!
//! With neither a key nor a password the result is a disabled credential set
//! and no login is attempted. Resolution performs no I/O; key files are read
//! by the catalog and configuration loaders.

use std::fmt;

pub const SUPERUSER: &str = "root";

/// How a session authenticates
#[derive(Clone, PartialEq, Eq)]
pub enum Auth {
    NoAuth,
    Password(String),
    PrivateKey {
        key: Vec<u8>,
        passphrase: Option<String>,
    },
}

impl Auth {
    pub fn kind(&self) -> &'static str {
        match self {
            Auth::NoAuth => "none",
            Auth::Password(_) => "password",
            Auth::PrivateKey {
                passphrase: Some(_),
                ..
            } => "private key (passphrase)",
            Auth::PrivateKey { .. } => "private key",
        }
    }
}

// Secrets never reach logs through Debug.
impl fmt::Debug for Auth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Auth({})", self.kind())
    }
}

/// Resolved login identity for one instance
#[derive(Clone, PartialEq, Eq)]
pub struct CredentialSet {
    username: String,
    auth: Auth,
    sudo: bool,
    sudo_password: Option<String>,
}

impl fmt::Debug for CredentialSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialSet")
            .field("username", &self.username)
            .field("auth", &self.auth)
            .field("sudo", &self.sudo)
            .finish()
    }
}

impl CredentialSet {
    /// The only way to build a set without an authentication factor.
    pub fn disabled(username: impl Into<String>) -> Self {
        let username = username.into();
        let sudo = username != SUPERUSER;
        Self {
            username,
            auth: Auth::NoAuth,
            sudo,
            sudo_password: None,
        }
    }

    pub fn with_password(username: impl Into<String>, password: impl Into<String>) -> Self {
        let username = username.into();
        let password = password.into();
        Self {
            sudo: username != SUPERUSER,
            sudo_password: Some(password.clone()),
            auth: Auth::Password(password),
            username,
        }
    }

    pub fn with_private_key(
        username: impl Into<String>,
        key: Vec<u8>,
        passphrase: Option<String>,
    ) -> Self {
        let username = username.into();
        Self {
            sudo: username != SUPERUSER,
            sudo_password: None,
            auth: Auth::PrivateKey { key, passphrase },
            username,
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn auth(&self) -> &Auth {
        &self.auth
    }

    pub fn is_enabled(&self) -> bool {
        !matches!(self.auth, Auth::NoAuth)
    }

    /// True when the login is not the superuser and scripts must escalate.
    pub fn sudo(&self) -> bool {
        self.sudo
    }

    /// Password fed to `sudo -S`, if any.
    pub fn sudo_password(&self) -> Option<&str> {
        self.sudo_password.as_deref()
    }

    /// Password that authenticates the session. `None` under key auth even
    /// when the login also has a password; see `login_password`.
    pub fn password(&self) -> Option<&str> {
        match &self.auth {
            Auth::Password(password) => Some(password),
            _ => None,
        }
    }

    /// The account password resolved for this login, whichever factor
    /// authenticates. Under key auth it is only used for `sudo -S`.
    pub fn login_password(&self) -> Option<&str> {
        self.password().or(self.sudo_password())
    }

    pub fn private_key(&self) -> Option<&[u8]> {
        match &self.auth {
            Auth::PrivateKey { key, .. } => Some(key),
            _ => None,
        }
    }
}

/// Process-wide defaults from configuration
#[derive(Clone, Default, PartialEq, Eq)]
pub struct GlobalSshDefaults {
    pub user: Option<String>,
    pub key: Option<Vec<u8>>,
    pub key_passphrase: Option<String>,
}

impl fmt::Debug for GlobalSshDefaults {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GlobalSshDefaults")
            .field("user", &self.user)
            .field("key", &self.key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Instance-level login material, borrowed from the catalog
#[derive(Debug, Clone, Copy, Default)]
pub struct InstanceLogin<'a> {
    pub username: Option<&'a str>,
    pub password: Option<&'a str>,
    pub private_key: Option<&'a [u8]>,
    pub private_key_password: Option<&'a str>,
}

fn present(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.is_empty())
}

/// Merge instance and global material into one credential set.
pub fn resolve(instance: &InstanceLogin<'_>, global: &GlobalSshDefaults) -> CredentialSet {
    let username = present(instance.username)
        .or_else(|| present(global.user.as_deref()))
        .unwrap_or(SUPERUSER)
        .to_string();
    let password = present(instance.password);

    let key = match instance.private_key.filter(|k| !k.is_empty()) {
        Some(key) => Some((
            key,
            present(instance.private_key_password)
                .or(password)
                .map(str::to_string),
        )),
        None => global
            .key
            .as_deref()
            .filter(|k| !k.is_empty())
            .map(|key| (key, global.key_passphrase.clone())),
    };

    match (key, password) {
        (Some((key, passphrase)), password) => {
            let mut set = CredentialSet::with_private_key(username, key.to_vec(), passphrase);
            set.sudo_password = password.map(str::to_string);
            set
        }
        (None, Some(password)) => CredentialSet::with_password(username, password),
        (None, None) => CredentialSet::disabled(username),
    }
}
