//! Environment readiness checks run before any task execution.

use std::collections::HashMap;
use std::sync::Arc;

use af_core::config::PreflightConfig;
use af_core::store::TaskStore;
use af_core::types::{ActivityKind, ActivityRecord};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// Credential lookup
// ---------------------------------------------------------------------------

/// Where credentials are read from. Values are never logged.
pub trait CredentialSource: Send + Sync {
    fn get(&self, name: &str) -> Option<String>;
}

/// Reads the process environment.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessEnv;

impl CredentialSource for ProcessEnv {
    fn get(&self, name: &str) -> Option<String> {
        std::env::var(name).ok()
    }
}

impl CredentialSource for HashMap<String, String> {
    fn get(&self, name: &str) -> Option<String> {
        HashMap::get(self, name).cloned()
    }
}

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum PreflightIssue {
    /// Named credential variable is unset or blank.
    MissingCredential(String),
    /// The task store did not answer a ping.
    StoreUnreachable(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreflightReport {
    pub ready: bool,
    pub issues: Vec<PreflightIssue>,
}

#[derive(Debug, thiserror::Error)]
pub enum PreflightError {
    /// Execution must not start. `message` is the localized text shown to
    /// the user.
    #[error("preflight failed: {message}")]
    NotReady {
        message: String,
        issues: Vec<PreflightIssue>,
    },
}

// ---------------------------------------------------------------------------
// Localisation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lang {
    En,
    Es,
}

impl Lang {
    /// `es`, `es-MX`, `es_AR` are Spanish; everything else falls back to English.
    fn from_locale(locale: &str) -> Self {
        let primary = locale
            .split(['-', '_'])
            .next()
            .unwrap_or_default()
            .to_ascii_lowercase();
        match primary.as_str() {
            "es" => Lang::Es,
            _ => Lang::En,
        }
    }
}

fn render_issue(lang: Lang, issue: &PreflightIssue) -> String {
    match (lang, issue) {
        (Lang::En, PreflightIssue::MissingCredential(name)) => {
            format!("Missing credential: set {name}")
        }
        (Lang::Es, PreflightIssue::MissingCredential(name)) => {
            format!("Falta una credencial: define {name}")
        }
        (Lang::En, PreflightIssue::StoreUnreachable(detail)) => {
            format!("Task store is unreachable ({detail})")
        }
        (Lang::Es, PreflightIssue::StoreUnreachable(detail)) => {
            format!("No se puede acceder al almacén de tareas ({detail})")
        }
    }
}

/// Header line plus one bullet per blocking issue.
pub fn render_message(locale: &str, issues: &[PreflightIssue]) -> String {
    let lang = Lang::from_locale(locale);
    let header = match lang {
        Lang::En => "Cannot start the run. Resolve these issues first:",
        Lang::Es => "No se puede iniciar la ejecución. Resuelve primero estos problemas:",
    };
    let mut message = header.to_string();
    for issue in issues {
        message.push_str("\n- ");
        message.push_str(&render_issue(lang, issue));
    }
    message
}

// ---------------------------------------------------------------------------
// Preflight
// ---------------------------------------------------------------------------

pub struct Preflight {
    store: Arc<dyn TaskStore>,
    credentials: Arc<dyn CredentialSource>,
    config: PreflightConfig,
}

impl Preflight {
    pub fn new(store: Arc<dyn TaskStore>, config: PreflightConfig) -> Self {
        Self {
            store,
            credentials: Arc::new(ProcessEnv),
            config,
        }
    }

    pub fn with_credentials(mut self, credentials: Arc<dyn CredentialSource>) -> Self {
        self.credentials = credentials;
        self
    }

    /// Check every required credential and store reachability.
    pub async fn preflight_check(&self) -> PreflightReport {
        let mut issues: Vec<PreflightIssue> = self
            .config
            .required_env
            .iter()
            .filter(|name| {
                self.credentials
                    .get(name)
                    .is_none_or(|value| value.trim().is_empty())
            })
            .map(|name| PreflightIssue::MissingCredential(name.clone()))
            .collect();

        if let Err(e) = self.store.ping().await {
            issues.push(PreflightIssue::StoreUnreachable(e.to_string()));
        }

        PreflightReport {
            ready: issues.is_empty(),
            issues,
        }
    }

    /// Check readiness for `project_id`. When not ready, a localized message
    /// is logged to the project's activity (best effort) and returned as
    /// [`PreflightError::NotReady`].
    pub async fn run_preflight(
        &self,
        project_id: &str,
        locale: &str,
    ) -> Result<PreflightReport, PreflightError> {
        let report = self.preflight_check().await;
        if report.ready {
            info!(project_id, "preflight passed");
            return Ok(report);
        }

        let message = render_message(locale, &report.issues);
        warn!(project_id, issues = report.issues.len(), "preflight failed");

        let record = ActivityRecord::new(ActivityKind::PreflightFailed, message.clone());
        if let Err(e) = self.store.append_activity(project_id, record).await {
            warn!(project_id, error = %e, "could not record preflight failure");
        }

        Err(PreflightError::NotReady {
            message,
            issues: report.issues,
        })
    }
}
