use anyhow::{bail, Context, Result};
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::sync::RwLock;
use uuid::Uuid;

use crate::analyzer::AuthGate;
use crate::db::{
    models::{User, UserInfo},
    Database,
};

/// Account registration and sign-in, backed by the history store's
/// database. Holds at most one signed-in user at a time.
pub struct AuthService {
    db: Database,
    current: RwLock<Option<UserInfo>>,
}

impl AuthService {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            current: RwLock::new(None),
        }
    }

    /// Creates an account and signs it in immediately.
    pub async fn register(&self, name: &str, email: &str, password: &str) -> Result<UserInfo> {
        let name = name.trim();
        let email = email.trim();
        if name.is_empty() || email.is_empty() || password.is_empty() {
            bail!("name, email, and password are required");
        }

        if self.db.get_user_by_email(email).await?.is_some() {
            bail!("an account with this email already exists");
        }

        let user = User {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            email: email.to_string(),
            password_digest: digest_password(password),
            created_at: Utc::now(),
        };
        self.db
            .insert_user(&user)
            .await
            .context("failed to create account")?;

        let info = UserInfo::from(user);
        *self.current.write().unwrap() = Some(info.clone());
        Ok(info)
    }

    pub async fn login(&self, email: &str, password: &str) -> Result<UserInfo> {
        let user = self.db.get_user_by_email(email.trim()).await?;
        let Some(user) = user else {
            bail!("invalid email or password");
        };
        if user.password_digest != digest_password(password) {
            bail!("invalid email or password");
        }

        let info = UserInfo::from(user);
        *self.current.write().unwrap() = Some(info.clone());
        Ok(info)
    }

    pub fn logout(&self) {
        *self.current.write().unwrap() = None;
    }

    pub fn current_user(&self) -> Option<UserInfo> {
        self.current.read().unwrap().clone()
    }
}

impl AuthGate for AuthService {
    fn current_user_id(&self) -> Option<String> {
        self.current
            .read()
            .unwrap()
            .as_ref()
            .map(|user| user.id.clone())
    }
}

fn digest_password(password: &str) -> String {
    hex::encode(Sha256::digest(password.as_bytes()))
}
