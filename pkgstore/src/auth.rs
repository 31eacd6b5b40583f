//! # Auth Capability Chain
//!
//! Auth backends implement any subset of six capabilities. Each backend
//! declares that subset once through [`AuthPlugin::capabilities`]; the chain
//! records it at registration and never probes for support at call time.
//!
//! For every check the chain walks the backends in registration order:
//!
//! - a backend lacking the capability is skipped
//! - `Ok(true)` decides the check
//! - `Ok(false)` defers to the next backend
//! - `Err(_)` ends the walk with that error; a denial is `Err(Forbidden)`
//!
//! Access checks that no backend decides fall back to the `packages` access
//! lists of the registry configuration.

use crate::config::{PackageAccess, RegistryConfig};
use crate::plugin::Plugin;
use base64::{engine::general_purpose, Engine as _};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const ROLE_ALL: &str = "$all";
pub const ROLE_ANONYMOUS: &str = "$anonymous";
pub const ROLE_AUTHENTICATED: &str = "$authenticated";
const LEGACY_ROLE_ALL: &str = "@all";
const LEGACY_ROLE_ANONYMOUS: &str = "@anonymous";
const LEGACY_ROLE_AUTHENTICATED: &str = "@authenticated";

/// Failure of an auth check itself, as opposed to a negative decision.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("{0} is not supported by this backend")]
    Unsupported(&'static str),

    #[error("auth backend failure: {0}")]
    Backend(String),
}

impl AuthError {
    pub fn http_status(&self) -> u16 {
        match self {
            AuthError::Unauthorized(_) => 401,
            AuthError::Forbidden(_) => 403,
            AuthError::Conflict(_) => 409,
            AuthError::Unsupported(_) => 501,
            AuthError::Backend(_) => 500,
        }
    }
}

pub type AuthResult<T> = Result<T, AuthError>;

/// The identity a request acts as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteUser {
    pub name: Option<String>,
    /// Effective groups, including the pseudo-roles
    pub groups: Vec<String>,
    /// Groups reported by the authenticating backend
    pub real_groups: Vec<String>,
    /// Why authentication failed, for anonymous users created from a failure
    pub error: Option<String>,
}

impl RemoteUser {
    pub fn anonymous() -> Self {
        Self {
            name: None,
            groups: vec![
                ROLE_ALL.to_string(),
                ROLE_ANONYMOUS.to_string(),
                LEGACY_ROLE_ALL.to_string(),
                LEGACY_ROLE_ANONYMOUS.to_string(),
            ],
            real_groups: Vec::new(),
            error: None,
        }
    }

    pub fn anonymous_with_error(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::anonymous()
        }
    }

    pub fn authenticated(name: &str, groups: Vec<String>) -> Self {
        let mut effective = groups.clone();
        for role in [
            ROLE_ALL,
            ROLE_AUTHENTICATED,
            LEGACY_ROLE_ALL,
            LEGACY_ROLE_AUTHENTICATED,
        ] {
            if !effective.iter().any(|g| g == role) {
                effective.push(role.to_string());
            }
        }
        Self {
            name: Some(name.to_string()),
            groups: effective,
            real_groups: groups,
            error: None,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.name.is_some()
    }

    /// Whether any entry of `list` names this user or one of its groups.
    pub fn matches_any(&self, list: &[String]) -> bool {
        list.iter().any(|entry| {
            self.name.as_deref() == Some(entry.as_str()) || self.groups.iter().any(|g| g == entry)
        })
    }
}

impl fmt::Display for RemoteUser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name.as_deref().unwrap_or("<anonymous>"))
    }
}

/// The capabilities one backend implements.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AuthCapabilities {
    pub authenticate: bool,
    pub add_user: bool,
    pub change_password: bool,
    pub allow_access: bool,
    pub allow_publish: bool,
    pub allow_unpublish: bool,
}

impl AuthCapabilities {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn all() -> Self {
        Self {
            authenticate: true,
            add_user: true,
            change_password: true,
            allow_access: true,
            allow_publish: true,
            allow_unpublish: true,
        }
    }

    fn names(&self) -> Vec<&'static str> {
        [
            (self.authenticate, "authenticate"),
            (self.add_user, "add_user"),
            (self.change_password, "change_password"),
            (self.allow_access, "allow_access"),
            (self.allow_publish, "allow_publish"),
            (self.allow_unpublish, "allow_unpublish"),
        ]
        .into_iter()
        .filter_map(|(on, name)| on.then_some(name))
        .collect()
    }
}

/// An auth backend. Only the methods named in `capabilities()` are called.
#[async_trait::async_trait]
pub trait AuthPlugin: Plugin {
    fn capabilities(&self) -> AuthCapabilities;

    /// `Ok(Some(groups))` on success, `Ok(None)` to defer.
    async fn authenticate(&self, _user: &str, _password: &str) -> AuthResult<Option<Vec<String>>> {
        Err(AuthError::Unsupported("authenticate"))
    }

    async fn add_user(&self, _user: &str, _password: &str) -> AuthResult<bool> {
        Err(AuthError::Unsupported("add_user"))
    }

    async fn change_password(&self, _user: &str, _old: &str, _new: &str) -> AuthResult<bool> {
        Err(AuthError::Unsupported("change_password"))
    }

    async fn allow_access(&self, _user: &RemoteUser, _package: &str) -> AuthResult<bool> {
        Err(AuthError::Unsupported("allow_access"))
    }

    async fn allow_publish(&self, _user: &RemoteUser, _package: &str) -> AuthResult<bool> {
        Err(AuthError::Unsupported("allow_publish"))
    }

    async fn allow_unpublish(&self, _user: &RemoteUser, _package: &str) -> AuthResult<bool> {
        Err(AuthError::Unsupported("allow_unpublish"))
    }
}

/// Credentials carried by an `Authorization` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credentials {
    Basic { user: String, password: String },
    Bearer(String),
}

impl Credentials {
    pub fn from_header(value: &str) -> Option<Self> {
        let (scheme, rest) = value.trim().split_once(' ')?;
        let rest = rest.trim();
        if scheme.eq_ignore_ascii_case("bearer") {
            return (!rest.is_empty()).then(|| Credentials::Bearer(rest.to_string()));
        }
        if scheme.eq_ignore_ascii_case("basic") {
            let decoded = general_purpose::STANDARD.decode(rest).ok()?;
            let decoded = String::from_utf8(decoded).ok()?;
            let (user, password) = decoded.split_once(':')?;
            return Some(Credentials::Basic {
                user: user.to_string(),
                password: password.to_string(),
            });
        }
        None
    }
}

#[derive(Debug, Clone, Copy)]
enum AccessCheck {
    Access,
    Publish,
    Unpublish,
}

impl AccessCheck {
    fn supported(&self, caps: &AuthCapabilities) -> bool {
        match self {
            AccessCheck::Access => caps.allow_access,
            AccessCheck::Publish => caps.allow_publish,
            AccessCheck::Unpublish => caps.allow_unpublish,
        }
    }

    fn list<'a>(&self, access: &'a PackageAccess) -> &'a [String] {
        match self {
            AccessCheck::Access => access.access_list(),
            AccessCheck::Publish => access.publish_list(),
            AccessCheck::Unpublish => access.unpublish_list(),
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            AccessCheck::Access => "access",
            AccessCheck::Publish => "publish",
            AccessCheck::Unpublish => "unpublish",
        }
    }
}

struct Registered {
    plugin: Arc<dyn AuthPlugin>,
    capabilities: AuthCapabilities,
}

/// Ordered chain of auth backends.
pub struct AuthChain {
    config: Arc<RegistryConfig>,
    backends: Vec<Registered>,
}

impl AuthChain {
    pub fn new(config: Arc<RegistryConfig>) -> Self {
        Self {
            config,
            backends: Vec::new(),
        }
    }

    /// Append a backend; its capability set is read now and kept.
    pub fn register(&mut self, plugin: Arc<dyn AuthPlugin>) {
        let capabilities = plugin.capabilities();
        info!(
            version = %plugin.version(),
            capabilities = ?capabilities.names(),
            "Auth backend registered"
        );
        self.backends.push(Registered {
            plugin,
            capabilities,
        });
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    pub async fn authenticate(&self, user: &str, password: &str) -> AuthResult<RemoteUser> {
        for backend in self.backends.iter().filter(|b| b.capabilities.authenticate) {
            if let Some(groups) = backend.plugin.authenticate(user, password).await? {
                debug!(user = %user, "Authenticated");
                return Ok(RemoteUser::authenticated(user, groups));
            }
        }
        warn!(user = %user, "Authentication failed");
        Err(AuthError::Unauthorized(format!(
            "bad username or password for {user}"
        )))
    }

    /// Resolve an `Authorization` header to a user. A missing header is the
    /// anonymous user.
    pub async fn authenticate_header(&self, header: Option<&str>) -> AuthResult<RemoteUser> {
        let Some(header) = header else {
            return Ok(RemoteUser::anonymous());
        };
        match Credentials::from_header(header) {
            Some(Credentials::Basic { user, password }) => self.authenticate(&user, &password).await,
            Some(Credentials::Bearer(_)) => Err(AuthError::Unsupported("bearer authentication")),
            None => Err(AuthError::Unauthorized(
                "malformed Authorization header".to_string(),
            )),
        }
    }

    /// `Ok(false)` when no backend accepted the new user.
    pub async fn add_user(&self, user: &str, password: &str) -> AuthResult<bool> {
        for backend in self.backends.iter().filter(|b| b.capabilities.add_user) {
            if backend.plugin.add_user(user, password).await? {
                info!(user = %user, "User added");
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub async fn change_password(&self, user: &str, old: &str, new: &str) -> AuthResult<bool> {
        for backend in self.backends.iter().filter(|b| b.capabilities.change_password) {
            if backend.plugin.change_password(user, old, new).await? {
                info!(user = %user, "Password changed");
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub async fn allow_access(&self, user: &RemoteUser, package: &str) -> AuthResult<bool> {
        self.check(AccessCheck::Access, user, package).await
    }

    pub async fn allow_publish(&self, user: &RemoteUser, package: &str) -> AuthResult<bool> {
        self.check(AccessCheck::Publish, user, package).await
    }

    pub async fn allow_unpublish(&self, user: &RemoteUser, package: &str) -> AuthResult<bool> {
        self.check(AccessCheck::Unpublish, user, package).await
    }

    /// [`allow_publish`](Self::allow_publish) with a negative decision turned
    /// into `Forbidden`.
    pub async fn require_publish(&self, user: &RemoteUser, package: &str) -> AuthResult<()> {
        if self.allow_publish(user, package).await? {
            Ok(())
        } else {
            Err(AuthError::Forbidden(format!(
                "user {user} is not allowed to publish package {package}"
            )))
        }
    }

    async fn check(&self, check: AccessCheck, user: &RemoteUser, package: &str) -> AuthResult<bool> {
        for backend in self
            .backends
            .iter()
            .filter(|b| check.supported(&b.capabilities))
        {
            let decision = match check {
                AccessCheck::Access => backend.plugin.allow_access(user, package).await?,
                AccessCheck::Publish => backend.plugin.allow_publish(user, package).await?,
                AccessCheck::Unpublish => backend.plugin.allow_unpublish(user, package).await?,
            };
            if decision {
                debug!(user = %user, package = %package, check = check.as_str(), "Allowed by backend");
                return Ok(true);
            }
        }

        let allowed = self
            .config
            .matched_package_access(package)
            .is_some_and(|access| user.matches_any(check.list(access)));
        debug!(
            user = %user,
            package = %package,
            check = check.as_str(),
            allowed,
            "Decided by package access rules"
        );
        Ok(allowed)
    }

    /// Close every backend, reporting the first failure.
    pub async fn close(&self) -> crate::error::StorageResult<()> {
        let mut first_error = None;
        for backend in &self.backends {
            if let Err(e) = backend.plugin.close().await {
                warn!(error = %e, "Auth backend failed to close");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}
