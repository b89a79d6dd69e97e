use anyhow::{Context, Result};
use rusqlite::{params, Row};

use crate::db::{connection::Database, helpers::parse_datetime, models::User};

fn row_to_user(row: &Row) -> Result<User> {
    let created_at: String = row.get("created_at")?;

    Ok(User {
        id: row.get("id")?,
        name: row.get("name")?,
        email: row.get("email")?,
        password_digest: row.get("password_digest")?,
        created_at: parse_datetime(&created_at, "created_at")?,
    })
}

impl Database {
    pub async fn insert_user(&self, user: &User) -> Result<()> {
        let record = user.clone();
        self.execute(move |conn| {
            conn.execute(
                "INSERT INTO users (id, name, email, password_digest, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    record.id,
                    record.name,
                    record.email,
                    record.password_digest,
                    record.created_at.to_rfc3339(),
                ],
            )
            .context("failed to insert user")?;
            Ok(())
        })
        .await
    }

    pub async fn get_user_by_email(&self, email: &str) -> Result<Option<User>> {
        let email = email.to_string();
        self.execute(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, name, email, password_digest, created_at
                 FROM users
                 WHERE email = ?1",
            )?;

            let mut rows = stmt.query(params![email])?;
            match rows.next()? {
                Some(row) => Ok(Some(row_to_user(row)?)),
                None => Ok(None),
            }
        })
        .await
    }
}
