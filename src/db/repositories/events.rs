use anyhow::{Context, Result};
use rusqlite::{params, Row};
use serde_json::{from_str, to_string};

use crate::analyzer::{AnalysisEvent, AnalysisResult, HistorySink};
use crate::db::{
    connection::Database,
    helpers::{bool_from_i64, parse_datetime},
};

fn row_to_event(row: &Row) -> Result<AnalysisEvent> {
    let timestamp: String = row.get("timestamp")?;
    let is_healthy: i64 = row.get("is_healthy")?;
    let recommendations_json: String = row.get("recommendations_json")?;
    let recommendations: Vec<String> =
        from_str(&recommendations_json).context("failed to parse recommendations")?;

    Ok(AnalysisEvent {
        id: row.get("id")?,
        result: AnalysisResult {
            is_healthy: bool_from_i64(is_healthy, "is_healthy")?,
            issue_name: row.get("issue_name")?,
            description: row.get("description")?,
            recommendations,
        },
        image: row.get("image")?,
        timestamp: parse_datetime(&timestamp, "timestamp")?,
    })
}

impl Database {
    pub async fn insert_analysis_event(&self, user_id: &str, event: &AnalysisEvent) -> Result<()> {
        let user_id = user_id.to_string();
        let record = event.clone();
        self.execute(move |conn| {
            let recommendations_json = to_string(&record.result.recommendations)
                .context("failed to serialize recommendations")?;

            conn.execute(
                "INSERT OR REPLACE INTO analysis_events
                     (id, user_id, is_healthy, issue_name, description,
                      recommendations_json, image, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    record.id,
                    user_id,
                    record.result.is_healthy as i64,
                    record.result.issue_name,
                    record.result.description,
                    recommendations_json,
                    record.image,
                    record.timestamp.to_rfc3339(),
                ],
            )
            .context("failed to insert analysis event")?;
            Ok(())
        })
        .await
    }

    /// Newest first, for replay on login.
    pub async fn get_events_for_user(&self, user_id: &str) -> Result<Vec<AnalysisEvent>> {
        let user_id = user_id.to_string();
        self.execute(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, user_id, is_healthy, issue_name, description,
                        recommendations_json, image, timestamp
                 FROM analysis_events
                 WHERE user_id = ?1
                 ORDER BY timestamp DESC",
            )?;

            let mut rows = stmt.query(params![user_id])?;
            let mut events = Vec::new();
            while let Some(row) = rows.next()? {
                events.push(row_to_event(row)?);
            }

            Ok(events)
        })
        .await
    }
}

#[async_trait::async_trait]
impl HistorySink for Database {
    async fn record(&self, user_id: &str, event: &AnalysisEvent) -> Result<()> {
        self.insert_analysis_event(user_id, event).await
    }
}
