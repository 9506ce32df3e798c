//! Neo4j-backed [`GraphStore`] over the HTTP transaction API.
//!
//! Every statement filters on `user_id` at the node level: facts are
//! attached to their owner via `(:User)-[:REMEMBERS]->(:Fact)` and all
//! queries start from the owner node, so a missing scope cannot match
//! another tenant's subgraph. Transient failures (5xx, timeouts) retry
//! with exponential back-off; 4xx is permanent.

use std::time::Duration;

use serde_json::{json, Value};

use crate::store::{require_user_scope, GraphStore};
use crate::text::group_by_dominant;
use crate::types::{content_hash, Fact, FactKind, MaintenanceParams, RecallLayer, Snippet};
use palaver_domain::config::Neo4jConfig;
use palaver_domain::{Error, Result};

const HALF_LIFE_DAYS: f64 = 30.0;
const SALIENCE_FLOOR: f64 = 0.1;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Client
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct Neo4jStore {
    http: reqwest::Client,
    tx_url: String,
    username: Option<String>,
    password: Option<String>,
    max_retries: u32,
}

impl Neo4jStore {
    pub fn new(cfg: &Neo4jConfig) -> Result<Self> {
        if cfg.uri.trim().is_empty() {
            return Err(Error::Config("memory.neo4j.uri is empty".into()));
        }
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(cfg.timeout_ms))
            .build()
            .map_err(|e| Error::Internal(format!("building neo4j client: {e}")))?;
        Ok(Self {
            http,
            tx_url: format!(
                "{}/db/{}/tx/commit",
                cfg.uri.trim_end_matches('/'),
                cfg.database
            ),
            username: cfg.username.clone(),
            password: cfg.password.clone(),
            max_retries: cfg.max_retries,
        })
    }

    /// Run one or more Cypher statements in a single transaction and
    /// return the row arrays per statement.
    async fn execute(&self, statements: Vec<Value>) -> Result<Vec<Vec<Value>>> {
        let body = json!({ "statements": statements });
        let mut last_err: Option<Error> = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_millis(100 * 2u64.pow(attempt - 1))).await;
            }

            let mut rb = self.http.post(&self.tx_url).json(&body);
            if let Some(user) = &self.username {
                rb = rb.basic_auth(user, self.password.as_deref());
            }

            let resp = match rb.send().await {
                Ok(resp) => resp,
                Err(e) => {
                    last_err = Some(Error::UpstreamUnavailable(format!("neo4j: {e}")));
                    continue;
                }
            };

            let status = resp.status();
            if status.is_server_error() {
                last_err = Some(Error::UpstreamUnavailable(format!("neo4j returned {status}")));
                continue;
            }
            if status == reqwest::StatusCode::UNAUTHORIZED {
                return Err(Error::Unauthorized("neo4j rejected credentials".into()));
            }
            if !status.is_success() {
                return Err(Error::Internal(format!("neo4j returned {status}")));
            }

            let payload: Value = resp
                .json()
                .await
                .map_err(|e| Error::UpstreamUnavailable(format!("neo4j body: {e}")))?;

            if let Some(errors) = payload.get("errors").and_then(|e| e.as_array()) {
                if !errors.is_empty() {
                    return Err(Error::Internal(format!(
                        "neo4j statement failed: {}",
                        errors[0]
                            .get("message")
                            .and_then(|m| m.as_str())
                            .unwrap_or("unknown")
                    )));
                }
            }

            let results = payload
                .get("results")
                .and_then(|r| r.as_array())
                .map(|stmts| {
                    stmts
                        .iter()
                        .map(|stmt| {
                            stmt.get("data")
                                .and_then(|d| d.as_array())
                                .map(|rows| {
                                    rows.iter()
                                        .filter_map(|r| r.get("row").cloned())
                                        .collect()
                                })
                                .unwrap_or_default()
                        })
                        .collect()
                })
                .unwrap_or_default();
            return Ok(results);
        }

        Err(last_err.unwrap_or_else(|| Error::UpstreamUnavailable("neo4j: retries exhausted".into())))
    }

    async fn upsert_row(
        &self,
        user_id: &str,
        content: &str,
        kind: &str,
        hash: &str,
        fact: &Fact,
    ) -> Result<bool> {
        let statement = json!({
            "statement": "MERGE (u:User {user_id: $user_id}) \
                          MERGE (u)-[:REMEMBERS]->(f:Fact {content_hash: $hash, user_id: $user_id}) \
                          ON CREATE SET f.fact_id = $fact_id, f.content = $content, f.kind = $kind, \
                                        f.created_at = $created_at, f.session_id = $session_id, \
                                        f.salience = $salience, f._created = true \
                          ON MATCH SET f._created = false \
                          RETURN f._created",
            "parameters": {
                "user_id": user_id,
                "hash": hash,
                "fact_id": fact.fact_id,
                "content": content,
                "kind": kind,
                "created_at": fact.created_at.to_rfc3339(),
                "session_id": fact.session_id,
                "salience": fact.salience,
            }
        });
        let results = self.execute(vec![statement]).await?;
        let created = results
            .first()
            .and_then(|rows| rows.first())
            .and_then(|row| row.get(0))
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        Ok(created)
    }
}

fn kind_str(kind: FactKind) -> &'static str {
    match kind {
        FactKind::Fact => "fact",
        FactKind::Concept => "concept",
        FactKind::Summary => "summary",
    }
}

fn kind_layer(kind: &str) -> RecallLayer {
    match kind {
        "concept" => RecallLayer::Concept,
        "summary" => RecallLayer::Summary,
        _ => RecallLayer::Direct,
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GraphStore
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait::async_trait]
impl GraphStore for Neo4jStore {
    async fn upsert_fact(&self, user_id: &str, fact: Fact) -> Result<bool> {
        require_user_scope(user_id)?;
        self.upsert_row(
            user_id,
            &fact.content,
            kind_str(fact.kind),
            &fact.content_hash,
            &fact,
        )
        .await
    }

    async fn search(&self, user_id: &str, query: &str, k: usize) -> Result<Vec<Snippet>> {
        require_user_scope(user_id)?;
        let tokens: Vec<String> = crate::text::tokenize(query);
        if tokens.is_empty() {
            return Ok(Vec::new());
        }

        let match_stmt = json!({
            "statement": "MATCH (u:User {user_id: $user_id})-[:REMEMBERS]->(f:Fact) \
                          WITH f, size([tok IN $tokens WHERE toLower(f.content) CONTAINS tok]) AS hits \
                          WHERE hits > 0 \
                          RETURN f.content, f.kind, f.created_at, hits * f.salience AS score \
                          ORDER BY score DESC LIMIT $limit",
            "parameters": { "user_id": user_id, "tokens": tokens, "limit": (k * 2) as u64 }
        });
        let recent_stmt = json!({
            "statement": "MATCH (u:User {user_id: $user_id})-[:REMEMBERS]->(f:Fact {kind: 'fact'}) \
                          RETURN f.content, f.kind, f.created_at, 0.0 \
                          ORDER BY f.created_at DESC LIMIT 2",
            "parameters": { "user_id": user_id }
        });

        let results = self.execute(vec![match_stmt, recent_stmt]).await?;
        let mut out = Vec::new();
        let mut direct_seen = 0usize;

        for row in results.first().into_iter().flatten() {
            let content = row.get(0).and_then(|v| v.as_str()).unwrap_or("").to_owned();
            let kind = row.get(1).and_then(|v| v.as_str()).unwrap_or("fact");
            let created_at = parse_ts(row.get(2));
            let score = row.get(3).and_then(|v| v.as_f64()).unwrap_or(0.0);

            let layer = if kind == "fact" {
                direct_seen += 1;
                if direct_seen <= k {
                    RecallLayer::Direct
                } else {
                    RecallLayer::Related
                }
            } else {
                kind_layer(kind)
            };
            out.push(Snippet {
                content,
                layer,
                score,
                created_at,
            });
        }

        for row in results.get(1).into_iter().flatten() {
            let content = row.get(0).and_then(|v| v.as_str()).unwrap_or("").to_owned();
            if out.iter().any(|s| s.content == content) {
                continue;
            }
            out.push(Snippet {
                content,
                layer: RecallLayer::Recent,
                score: 0.0,
                created_at: parse_ts(row.get(2)),
            });
        }

        Ok(out)
    }

    async fn cluster(&self, user_id: &str, params: &MaintenanceParams) -> Result<usize> {
        require_user_scope(user_id)?;

        // Fetch a bounded batch of raw facts, group client-side, write
        // concepts back. Content-hash dedup keeps re-runs idempotent.
        let fetch = json!({
            "statement": "MATCH (u:User {user_id: $user_id})-[:REMEMBERS]->(f:Fact {kind: 'fact'}) \
                          RETURN f.content ORDER BY f.created_at LIMIT $limit",
            "parameters": { "user_id": user_id, "limit": params.batch as u64 }
        });
        let results = self.execute(vec![fetch]).await?;
        let contents = results
            .first()
            .into_iter()
            .flatten()
            .filter_map(|row| row.get(0).and_then(|v| v.as_str()).map(str::to_owned));

        let mut created = 0;
        let mut topics: Vec<_> = group_by_dominant(contents, 3).into_iter().collect();
        topics.sort_by(|a, b| a.0.cmp(&b.0));
        for (topic, members) in topics {
            let content = format!("{topic}: {}", members.join(" | "));
            let fact = Fact {
                kind: FactKind::Concept,
                ..Fact::new(content.clone(), None)
            };
            if self
                .upsert_row(user_id, &content, "concept", &content_hash(&content), &fact)
                .await?
            {
                created += 1;
            }
        }
        Ok(created)
    }

    async fn summarize(&self, user_id: &str, params: &MaintenanceParams) -> Result<usize> {
        require_user_scope(user_id)?;

        let fetch = json!({
            "statement": "MATCH (u:User {user_id: $user_id})-[:REMEMBERS]->(f:Fact {kind: 'concept'}) \
                          RETURN f.content ORDER BY f.created_at LIMIT $limit",
            "parameters": { "user_id": user_id, "limit": params.batch as u64 }
        });
        let results = self.execute(vec![fetch]).await?;
        let concepts: Vec<String> = results
            .first()
            .into_iter()
            .flatten()
            .filter_map(|row| row.get(0).and_then(|v| v.as_str()).map(str::to_owned))
            .collect();
        if concepts.len() < 3 {
            return Ok(0);
        }

        let content = format!(
            "Summary of {} concepts: {}",
            concepts.len(),
            concepts.join("; ")
        );
        let fact = Fact {
            kind: FactKind::Summary,
            ..Fact::new(content.clone(), None)
        };
        let created = self
            .upsert_row(user_id, &content, "summary", &content_hash(&content), &fact)
            .await?;
        Ok(usize::from(created))
    }

    async fn decay(&self, user_id: &str, _params: &MaintenanceParams) -> Result<usize> {
        require_user_scope(user_id)?;

        // Salience recomputes from age, so repeated passes converge.
        let statement = json!({
            "statement": "MATCH (u:User {user_id: $user_id})-[:REMEMBERS]->(f:Fact) \
                          SET f.salience = 0.5 ^ (duration.inSeconds(datetime(f.created_at), datetime()).seconds / 86400.0 / $half_life) \
                          WITH f WHERE f.salience < $floor \
                          DETACH DELETE f \
                          RETURN count(f)",
            "parameters": { "user_id": user_id, "half_life": HALF_LIFE_DAYS, "floor": SALIENCE_FLOOR }
        });
        let results = self.execute(vec![statement]).await?;
        Ok(results
            .first()
            .and_then(|rows| rows.first())
            .and_then(|row| row.get(0))
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as usize)
    }
}

fn parse_ts(v: Option<&Value>) -> chrono::DateTime<chrono::Utc> {
    v.and_then(|v| v.as_str())
        .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&chrono::Utc))
        .unwrap_or_else(chrono::Utc::now)
}
