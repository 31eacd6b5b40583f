//! Auth chain tests against a YAML-configured access policy

use anyhow::Result;
use pkgstore::{
    AuthCapabilities, AuthChain, AuthError, AuthPlugin, AuthResult, Plugin, RegistryConfig,
    RemoteUser,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

const POLICY: &str = r#"
storage: ./storage
packages:
  "@internal/*":
    access: $authenticated
    publish: admins
  "**":
    access: $all
    publish: $authenticated
"#;

/// Password file kept in memory; never answers access questions.
#[derive(Default)]
struct Passwords {
    users: Mutex<HashMap<String, String>>,
    groups: HashMap<String, Vec<String>>,
}

#[async_trait::async_trait]
impl Plugin for Passwords {
    fn version(&self) -> &str {
        "1.0.0"
    }
}

#[async_trait::async_trait]
impl AuthPlugin for Passwords {
    fn capabilities(&self) -> AuthCapabilities {
        AuthCapabilities {
            authenticate: true,
            add_user: true,
            ..AuthCapabilities::none()
        }
    }

    async fn authenticate(&self, user: &str, password: &str) -> AuthResult<Option<Vec<String>>> {
        let users = self.users.lock().map_err(|e| AuthError::Backend(e.to_string()))?;
        match users.get(user) {
            Some(stored) if stored == password => {
                Ok(Some(self.groups.get(user).cloned().unwrap_or_default()))
            }
            Some(_) => Err(AuthError::Unauthorized(format!("wrong password for {user}"))),
            None => Ok(None),
        }
    }

    async fn add_user(&self, user: &str, password: &str) -> AuthResult<bool> {
        let mut users = self.users.lock().map_err(|e| AuthError::Backend(e.to_string()))?;
        if users.contains_key(user) {
            return Err(AuthError::Conflict(format!("user {user} already exists")));
        }
        users.insert(user.to_string(), password.to_string());
        Ok(true)
    }
}

fn chain() -> Result<AuthChain> {
    let config = Arc::new(RegistryConfig::from_yaml(POLICY)?);
    let mut passwords = Passwords::default();
    passwords
        .groups
        .insert("root".to_string(), vec!["admins".to_string()]);
    let mut chain = AuthChain::new(config);
    chain.register(Arc::new(passwords));
    Ok(chain)
}

#[tokio::test]
async fn test_signup_then_login() -> Result<()> {
    let chain = chain()?;
    assert!(chain.add_user("alice", "hunter2").await?);
    assert!(matches!(
        chain.add_user("alice", "again").await,
        Err(AuthError::Conflict(_))
    ));

    let alice = chain.authenticate("alice", "hunter2").await?;
    assert_eq!(alice.name.as_deref(), Some("alice"));
    assert!(alice.is_authenticated());

    let err = chain.authenticate("alice", "wrong").await.unwrap_err();
    assert_eq!(err.http_status(), 401);
    assert!(matches!(
        chain.authenticate("nobody", "x").await,
        Err(AuthError::Unauthorized(_))
    ));
    Ok(())
}

#[tokio::test]
async fn test_access_falls_back_to_package_rules() -> Result<()> {
    let chain = chain()?;
    chain.add_user("alice", "pw").await?;
    chain.add_user("root", "pw").await?;
    let alice = chain.authenticate("alice", "pw").await?;
    let root = chain.authenticate("root", "pw").await?;
    let anonymous = RemoteUser::anonymous();

    assert!(chain.allow_access(&anonymous, "lodash").await?);
    assert!(!chain.allow_publish(&anonymous, "lodash").await?);
    assert!(chain.allow_publish(&alice, "lodash").await?);

    assert!(!chain.allow_access(&anonymous, "@internal/tools").await?);
    assert!(chain.allow_access(&alice, "@internal/tools").await?);
    assert!(!chain.allow_publish(&alice, "@internal/tools").await?);
    assert!(chain.allow_publish(&root, "@internal/tools").await?);
    // Unpublish inherits the publish list when unset.
    assert!(chain.allow_unpublish(&root, "@internal/tools").await?);
    assert!(!chain.allow_unpublish(&alice, "@internal/tools").await?);

    let err = chain
        .require_publish(&alice, "@internal/tools")
        .await
        .unwrap_err();
    assert_eq!(err.http_status(), 403);
    Ok(())
}

#[tokio::test]
async fn test_basic_header_login() -> Result<()> {
    let chain = chain()?;
    chain.add_user("alice", "pw").await?;

    // "alice:pw"
    let user = chain.authenticate_header(Some("Basic YWxpY2U6cHc=")).await?;
    assert_eq!(user.name.as_deref(), Some("alice"));

    let anonymous = chain.authenticate_header(None).await?;
    assert!(!anonymous.is_authenticated());
    assert!(matches!(
        chain.authenticate_header(Some("Digest abc")).await,
        Err(AuthError::Unauthorized(_))
    ));
    Ok(())
}
