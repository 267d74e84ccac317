//! Cycle orchestration: cron-driven detection, backlog merge, dispatch,
//! watermark advance, and database backups with retention cleanup.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use mention_store::{ItemKind, MentionMatcher, SqliteMentionStore};
use serde::Serialize;

use crate::assistant::{AssistantCliInvoker, AssistantInvoker};
use crate::config::{next_cron_occurrence, parse_cron_schedule, BotConfig};
use crate::dispatch::{DispatchReport, MentionDispatcher};
use crate::github::{GithubApiClient, HostingApi};
use crate::prompts::PromptLibrary;
use crate::scanner::{MentionEvent, MentionScanner};

/// Result of one full detect-and-dispatch cycle.
#[derive(Debug, Default, Clone)]
pub struct CycleOutcome {
    /// Cycle was skipped because a previous one is still draining.
    pub skipped: bool,
    pub new_mentions: usize,
    pub backlog_mentions: usize,
    pub report: DispatchReport,
}

/// Snapshot for the status surface.
#[derive(Debug, Clone, Serialize)]
pub struct BotStatus {
    pub repo: String,
    pub detection_cron: String,
    pub backup_cron: String,
    pub watermark: String,
    pub draining: bool,
    pub running_dispatches: usize,
    pub cycles_completed: u64,
    pub last_cycle_at: Option<String>,
    pub pending_mentions: usize,
    pub today: Option<DailyStatsStatus>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DailyStatsStatus {
    pub date: String,
    pub total_checks: u64,
    pub new_mentions: u64,
    pub processed_mentions: u64,
    pub api_calls: u64,
    pub tokens_used: u64,
}

struct BotState {
    watermark: DateTime<Utc>,
    draining: bool,
    cycles_completed: u64,
    last_cycle_at: Option<DateTime<Utc>>,
}

pub struct MentionBot {
    config: BotConfig,
    store: Arc<SqliteMentionStore>,
    api: Arc<dyn HostingApi>,
    scanner: MentionScanner,
    dispatcher: MentionDispatcher,
    state: Arc<Mutex<BotState>>,
}

/// Clears the draining flag when a cycle exits, error paths included.
struct DrainGuard {
    state: Arc<Mutex<BotState>>,
}

impl Drop for DrainGuard {
    fn drop(&mut self) {
        if let Ok(mut state) = self.state.lock() {
            state.draining = false;
        }
    }
}

impl MentionBot {
    /// Wires the production api client and assistant invoker from config.
    pub fn new(config: BotConfig) -> Result<Self> {
        let api: Arc<dyn HostingApi> = Arc::new(GithubApiClient::new(
            config.api_base.clone(),
            config.github_token.clone(),
            config.repo.clone(),
            config.request_timeout_ms,
            config.retry_max_attempts,
            config.retry_base_delay_ms,
        )?);
        let invoker: Arc<dyn AssistantInvoker> = Arc::new(AssistantCliInvoker::new(
            config.assistant_executable.clone(),
            config.workspace_dir.clone(),
            config.assistant_api_key.clone(),
            config.assistant_timeout_ms,
        )?);
        Self::with_parts(config, api, invoker)
    }

    /// Wires the bot around injected api and invoker implementations.
    pub fn with_parts(
        config: BotConfig,
        api: Arc<dyn HostingApi>,
        invoker: Arc<dyn AssistantInvoker>,
    ) -> Result<Self> {
        let matcher = MentionMatcher::new(&config.mention_patterns);
        let store = Arc::new(
            SqliteMentionStore::new(&config.db_path, matcher.clone())
                .context("failed to open mention store")?,
        );
        let prompts = PromptLibrary::load(config.template_dir.as_deref())?;
        let scanner = MentionScanner::new(Arc::clone(&api), Arc::clone(&store), matcher);
        let dispatcher = MentionDispatcher::new(
            Arc::clone(&store),
            Arc::clone(&api),
            invoker,
            prompts,
            config.repo.clone(),
            config.mention_patterns.clone(),
            config.max_concurrent,
            config.daily_token_limit,
            Duration::from_millis(config.dispatch_delay_ms),
            config.workspace_dir.display().to_string(),
            config.assistant_executable.clone(),
        );
        let state = Arc::new(Mutex::new(BotState {
            watermark: BotConfig::default_watermark(),
            draining: false,
            cycles_completed: 0,
            last_cycle_at: None,
        }));
        Ok(Self {
            config,
            store,
            api,
            scanner,
            dispatcher,
            state,
        })
    }

    pub fn store(&self) -> &Arc<SqliteMentionStore> {
        &self.store
    }

    /// One detect-and-dispatch cycle.
    ///
    /// Skips entirely when a previous cycle is still dispatching. The
    /// watermark moves to the cycle start time only after the whole batch
    /// has been handled, so a mid-cycle crash re-observes the window.
    pub async fn run_once(&self) -> Result<CycleOutcome> {
        let (watermark, cycle_start) = {
            let mut state = self
                .state
                .lock()
                .map_err(|_| anyhow::anyhow!("bot state lock is poisoned"))?;
            if state.draining {
                tracing::warn!("previous cycle still dispatching, skipping this cycle");
                return Ok(CycleOutcome {
                    skipped: true,
                    ..CycleOutcome::default()
                });
            }
            state.draining = true;
            (state.watermark, Utc::now())
        };
        let _guard = DrainGuard {
            state: Arc::clone(&self.state),
        };

        let scan = self.scanner.scan_since(watermark).await?;
        let new_mentions = scan.events.len();
        let events = self.merge_with_backlog(scan.events)?;
        let backlog_mentions = events.len().saturating_sub(new_mentions);

        let report = self.dispatcher.dispatch(&events).await?;

        let mut state = self
            .state
            .lock()
            .map_err(|_| anyhow::anyhow!("bot state lock is poisoned"))?;
        state.watermark = cycle_start;
        state.cycles_completed += 1;
        state.last_cycle_at = Some(cycle_start);
        Ok(CycleOutcome {
            skipped: false,
            new_mentions,
            backlog_mentions,
            report,
        })
    }

    /// Union of freshly scanned events and persisted unprocessed history,
    /// keyed by history id and `(kind, item_id)`. Backlog entries come
    /// first; they are the older work.
    fn merge_with_backlog(&self, fresh: Vec<MentionEvent>) -> Result<Vec<MentionEvent>> {
        let fresh_ids: HashSet<i64> = fresh.iter().map(|event| event.record_id).collect();
        let fresh_items: HashSet<(ItemKind, u64)> = fresh
            .iter()
            .map(|event| (event.kind, event.item_id))
            .collect();

        let mut merged = Vec::new();
        for record in self.store.unprocessed_mentions()? {
            if fresh_ids.contains(&record.id) || fresh_items.contains(&(record.kind, record.item_id))
            {
                continue;
            }
            merged.push(MentionEvent::from_record(&record));
        }
        if !merged.is_empty() {
            tracing::info!(backlog = merged.len(), "resuming unprocessed mentions");
        }
        merged.extend(fresh);
        Ok(merged)
    }

    /// Verifies hosting-api connectivity, then runs detection and backup on
    /// their cron schedules until `shutdown` flips to true. The first
    /// detection cycle runs immediately.
    pub async fn run_until(
        &self,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> Result<()> {
        let detection = parse_cron_schedule(&self.config.detection_cron)?;
        let backup = parse_cron_schedule(&self.config.backup_cron)?;

        // Surfaces a bad token or unreachable api at startup instead of as
        // a generic first-cycle failure.
        match self.api.get_repository().await {
            Ok(repository) => {
                tracing::info!(repo = repository.full_name, "hosting api reachable");
            }
            Err(error) => {
                tracing::warn!(
                    error = format!("{error:#}"),
                    "hosting api connectivity check failed"
                );
            }
        }

        tracing::info!(
            repo = self.config.repo.full_name(),
            detection_cron = self.config.detection_cron,
            backup_cron = self.config.backup_cron,
            "mention bot started"
        );

        if let Err(error) = self.run_once().await {
            tracing::error!(error = format!("{error:#}"), "initial detection cycle failed");
        }

        loop {
            let now = Utc::now();
            let Some(next_detection) = next_cron_occurrence(&detection, now) else {
                bail!("detection schedule has no future occurrence");
            };
            let Some(next_backup) = next_cron_occurrence(&backup, now) else {
                bail!("backup schedule has no future occurrence");
            };

            let (due_at, is_backup) = if next_backup < next_detection {
                (next_backup, true)
            } else {
                (next_detection, false)
            };
            let wait = (due_at - now).to_std().unwrap_or(Duration::ZERO);

            tokio::select! {
                _ = tokio::time::sleep(wait) => {
                    let result = if is_backup {
                        self.backup_now().map(|_| ())
                    } else {
                        self.run_once().await.map(|_| ())
                    };
                    if let Err(error) = result {
                        // One bad cycle never takes the daemon down.
                        tracing::error!(
                            error = format!("{error:#}"),
                            backup = is_backup,
                            "scheduled task failed"
                        );
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("mention bot stopped");
        Ok(())
    }

    /// Snapshots a backup into the backup directory and prunes snapshots
    /// older than the retention window.
    pub fn backup_now(&self) -> Result<PathBuf> {
        let stamp = Utc::now().format("%Y-%m-%dT%H-%M-%SZ");
        let target = self
            .config
            .backup_dir
            .join(format!("mention_tracker_{stamp}.db"));
        self.store.backup(&target)?;
        self.cleanup_old_backups(&target);
        Ok(target)
    }

    /// Deletes backup files past retention, sparing the snapshot that was
    /// just written. Deletion failures are warnings; a stuck file never
    /// fails the backup that just succeeded.
    fn cleanup_old_backups(&self, just_created: &std::path::Path) {
        let retention =
            Duration::from_secs(u64::from(self.config.backup_retention_days) * 24 * 60 * 60);
        let cutoff = SystemTime::now()
            .checked_sub(retention)
            .unwrap_or(SystemTime::UNIX_EPOCH);

        let entries = match std::fs::read_dir(&self.config.backup_dir) {
            Ok(entries) => entries,
            Err(error) => {
                tracing::warn!(error = %error, "failed to list backup directory");
                return;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if !name.starts_with("mention_tracker_") || !name.ends_with(".db") {
                continue;
            }
            if path == just_created {
                continue;
            }
            let modified = entry
                .metadata()
                .and_then(|metadata| metadata.modified())
                .ok();
            let expired = match modified {
                Some(modified) => modified <= cutoff,
                None => false,
            };
            if expired {
                match std::fs::remove_file(&path) {
                    Ok(()) => tracing::info!(path = %path.display(), "expired backup removed"),
                    Err(error) => {
                        tracing::warn!(path = %path.display(), error = %error, "failed to remove expired backup");
                    }
                }
            }
        }
    }

    pub fn status(&self) -> Result<BotStatus> {
        let (watermark, draining, cycles_completed, last_cycle_at) = {
            let state = self
                .state
                .lock()
                .map_err(|_| anyhow::anyhow!("bot state lock is poisoned"))?;
            (
                state.watermark,
                state.draining,
                state.cycles_completed,
                state.last_cycle_at,
            )
        };
        let pending = self.store.unprocessed_mentions()?.len();
        let today = self.store.today_stats()?.map(|stats| DailyStatsStatus {
            date: stats.date,
            total_checks: stats.total_checks,
            new_mentions: stats.new_mentions,
            processed_mentions: stats.processed_mentions,
            api_calls: stats.api_calls,
            tokens_used: stats.tokens_used,
        });
        Ok(BotStatus {
            repo: self.config.repo.full_name(),
            detection_cron: self.config.detection_cron.clone(),
            backup_cron: self.config.backup_cron.clone(),
            watermark: watermark.to_rfc3339(),
            draining,
            running_dispatches: self.dispatcher.running(),
            cycles_completed,
            last_cycle_at: last_cycle_at.map(|at| at.to_rfc3339()),
            pending_mentions: pending,
            today,
        })
    }
}
