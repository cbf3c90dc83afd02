use std::thread::sleep;
use std::time::Duration;

use anyhow::{Result, bail};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::batch::BatchFetcher;
use crate::cancel::CancelToken;
use crate::conformity::NamespaceConformityTable;
use crate::engine::{ConvergenceEngine, EngineOptions, PortionReport};
use crate::error::{FetchError, FetchResult};
use crate::gateway::{LinkageStore, RemoteGateway, SeedQuery};
use crate::moves::{MoveReport, MoveScanOptions, MovedPagesTask};
use crate::sites::SiteMatrix;
use crate::walker::ChainSeed;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub login_attempts: usize,
    /// Doubles after every failed login.
    pub login_base_delay: Duration,
    pub portion_attempts: usize,
    pub portion_pause: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            login_attempts: 5,
            login_base_delay: Duration::from_secs(10),
            portion_attempts: 5,
            portion_pause: Duration::from_secs(20),
        }
    }
}

impl RetryPolicy {
    /// Same attempt counts without any pauses.
    pub fn immediate() -> Self {
        Self {
            login_base_delay: Duration::ZERO,
            portion_pause: Duration::ZERO,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunnerSettings {
    pub engine: EngineOptions,
    pub portions: Vec<usize>,
    pub portion_size: usize,
    pub retry: RetryPolicy,
}

/// Work selected on the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunMode {
    Pages(Vec<String>),
    Range {
        namespace: i32,
        from: String,
        /// Inclusive upper bound.
        to: Option<String>,
    },
    NewPages {
        namespace: i32,
        hours: u32,
        limit: usize,
    },
    Category {
        category: String,
        namespace: i32,
        /// Subcategory levels to descend; 0 lists direct members only.
        depth: u32,
        limit: usize,
    },
    UserContributions {
        user: String,
        namespace: i32,
        hours: u32,
        limit: usize,
    },
    Moves(MoveScanOptions),
    /// Existing redirects between two titles, handled like moved pages.
    RedirectRange {
        namespace: i32,
        from: String,
        /// Inclusive upper bound.
        to: Option<String>,
    },
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    pub language: String,
    pub portions: Vec<PortionReport>,
    pub moves: Vec<MoveReport>,
    /// One message per portion given up on.
    pub abandoned: Vec<String>,
    pub cancelled: bool,
}

impl RunReport {
    pub fn requests(&self) -> usize {
        self.portions.iter().map(|portion| portion.requests).sum::<usize>()
            + self.moves.iter().map(|moves| moves.requests).sum::<usize>()
    }
}

enum PortionOutcome<T> {
    Done(T),
    Abandoned(String),
    Cancelled,
}

/// Schedules portions of seeds through the engine, with login and portion retries.
pub struct Runner<C> {
    client: C,
    sites: SiteMatrix,
    conformity: NamespaceConformityTable,
    fetcher: BatchFetcher,
    settings: RunnerSettings,
}

impl<C> Runner<C>
where
    C: RemoteGateway + LinkageStore,
{
    pub fn new(
        client: C,
        sites: SiteMatrix,
        conformity: NamespaceConformityTable,
        settings: RunnerSettings,
        cancel: CancelToken,
    ) -> Self {
        let fetcher = BatchFetcher::new(&settings.portions, cancel);
        Self {
            client,
            sites,
            conformity,
            fetcher,
            settings,
        }
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    pub fn cancel_token(&self) -> &CancelToken {
        self.fetcher.cancel_token()
    }

    pub fn login_with_retry(&mut self, username: &str, password: &str) -> Result<()> {
        let policy = self.settings.retry.clone();
        let mut delay = policy.login_base_delay;
        for attempt in 1..=policy.login_attempts.max(1) {
            match self.client.login(username, password) {
                Ok(()) => return Ok(()),
                Err(error) => {
                    tracing::warn!(attempt, %error, "login failed");
                    if attempt < policy.login_attempts {
                        sleep(delay);
                        delay = delay.saturating_mul(2);
                    }
                }
            }
        }
        bail!(
            "login failed after {} attempts",
            policy.login_attempts.max(1)
        )
    }

    pub fn run(&mut self, code: &str, mode: &RunMode, now: DateTime<Utc>) -> Result<RunReport> {
        let Some(site) = self.sites.site(code).cloned() else {
            bail!(
                "language {code} has no site in project {}",
                self.sites.project()
            );
        };
        let mut report = RunReport {
            language: code.to_string(),
            ..RunReport::default()
        };

        match mode {
            RunMode::Pages(titles) => self.run_titles(code, titles, &mut report),
            RunMode::Range {
                namespace,
                from,
                to,
            } => self.run_range(code, *namespace, from, to.as_deref(), false, &mut report),
            RunMode::RedirectRange {
                namespace,
                from,
                to,
            } => self.run_range(code, *namespace, from, to.as_deref(), true, &mut report),
            RunMode::NewPages {
                namespace,
                hours,
                limit,
            } => {
                let query = SeedQuery::NewPages {
                    namespace: *namespace,
                    hours: *hours,
                    limit: *limit,
                };
                self.run_listed(code, &query, &mut report);
            }
            RunMode::Category {
                category,
                namespace,
                depth,
                limit,
            } => {
                let query = SeedQuery::CategoryMembers {
                    category: category.clone(),
                    namespace: *namespace,
                    depth: *depth,
                    limit: *limit,
                };
                self.run_listed(code, &query, &mut report);
            }
            RunMode::UserContributions {
                user,
                namespace,
                hours,
                limit,
            } => {
                let query = SeedQuery::UserContributions {
                    user: user.clone(),
                    namespace: *namespace,
                    hours: *hours,
                    limit: *limit,
                };
                self.run_listed(code, &query, &mut report);
            }
            RunMode::Moves(options) => {
                let label = format!("{code} move log");
                let listed = self.retry_portion(&label, |runner| {
                    let task = MovedPagesTask::new(&runner.sites, &runner.conformity, &runner.fetcher);
                    task.recent_moves(&mut runner.client, &site, options, now)
                });
                match listed {
                    PortionOutcome::Done(events) => {
                        for chunk in events.chunks(self.settings.portion_size.max(1)) {
                            let label = format!("{code} moves from {}", chunk[0].title);
                            match self.retry_portion(&label, |runner| {
                                let task = MovedPagesTask::new(
                                    &runner.sites,
                                    &runner.conformity,
                                    &runner.fetcher,
                                );
                                task.process_portion(&mut runner.client, code, chunk)
                            }) {
                                PortionOutcome::Done(moves) => report.moves.push(moves),
                                PortionOutcome::Abandoned(message) => report.abandoned.push(message),
                                PortionOutcome::Cancelled => {
                                    report.cancelled = true;
                                    break;
                                }
                            }
                        }
                    }
                    PortionOutcome::Abandoned(message) => report.abandoned.push(message),
                    PortionOutcome::Cancelled => report.cancelled = true,
                }
            }
        }

        tracing::info!(
            code,
            portions = report.portions.len(),
            abandoned = report.abandoned.len(),
            requests = report.requests(),
            cancelled = report.cancelled,
            "run finished"
        );
        Ok(report)
    }

    fn run_titles(&mut self, code: &str, titles: &[String], report: &mut RunReport) {
        for chunk in titles.chunks(self.settings.portion_size.max(1)) {
            if !self.run_portion(code, chunk, report) {
                break;
            }
        }
    }

    fn run_listed(&mut self, code: &str, query: &SeedQuery, report: &mut RunReport) {
        let Some(site) = self.sites.site(code).cloned() else {
            return;
        };
        let label = format!("{code} seed listing");
        match self.retry_portion(&label, |runner| runner.client.list_seeds(&site, query)) {
            PortionOutcome::Done(page) => {
                tracing::info!(code, seeds = page.titles.len(), "listed seed titles");
                self.run_titles(code, &page.titles, report);
            }
            PortionOutcome::Abandoned(message) => report.abandoned.push(message),
            PortionOutcome::Cancelled => report.cancelled = true,
        }
    }

    /// Pages through a namespace alphabetically. Content pages go to the
    /// engine; with `redirects`, redirect pages go to the moved-page task.
    fn run_range(
        &mut self,
        code: &str,
        namespace: i32,
        from: &str,
        to: Option<&str>,
        redirects: bool,
        report: &mut RunReport,
    ) {
        let Some(site) = self.sites.site(code).cloned() else {
            return;
        };
        let mut cursor = from.to_string();
        loop {
            let limit = self.settings.portion_size.max(1);
            let query = if redirects {
                SeedQuery::AllRedirects {
                    namespace,
                    from: cursor.clone(),
                    limit,
                }
            } else {
                SeedQuery::AllPages {
                    namespace,
                    from: cursor.clone(),
                    limit,
                }
            };
            let label = format!("{code} allpages from {cursor}");
            let page = match self.retry_portion(&label, |runner| runner.client.list_seeds(&site, &query)) {
                PortionOutcome::Done(page) => page,
                PortionOutcome::Abandoned(message) => {
                    report.abandoned.push(message);
                    return;
                }
                PortionOutcome::Cancelled => {
                    report.cancelled = true;
                    return;
                }
            };

            let titles: Vec<String> = page
                .titles
                .into_iter()
                .filter(|title| to.is_none_or(|bound| title.as_str() <= bound))
                .collect();
            let proceed = if redirects {
                self.run_redirect_portion(code, namespace, &titles, report)
            } else {
                self.run_portion(code, &titles, report)
            };
            if !proceed {
                return;
            }
            match page.next_from {
                Some(next) if to.is_none_or(|bound| next.as_str() <= bound) && next != cursor => {
                    cursor = next;
                }
                _ => return,
            }
        }
    }

    /// Returns false when the run must stop scheduling portions.
    fn run_portion(&mut self, code: &str, titles: &[String], report: &mut RunReport) -> bool {
        let Some(first) = titles.first() else {
            return true;
        };
        let label = format!("{code} portion from {first}");
        let engine_options = self.settings.engine.clone();
        match self.retry_portion(&label, |runner| {
            let engine = ConvergenceEngine::new(
                &runner.sites,
                &runner.conformity,
                &runner.fetcher,
                engine_options.clone(),
            );
            engine.run_portion(&mut runner.client, code, titles)
        }) {
            PortionOutcome::Done(portion) => {
                report.portions.push(portion);
                true
            }
            PortionOutcome::Abandoned(message) => {
                report.abandoned.push(message);
                true
            }
            PortionOutcome::Cancelled => {
                report.cancelled = true;
                false
            }
        }
    }

    fn run_redirect_portion(
        &mut self,
        code: &str,
        namespace: i32,
        titles: &[String],
        report: &mut RunReport,
    ) -> bool {
        let Some(first) = titles.first() else {
            return true;
        };
        let label = format!("{code} redirects from {first}");
        let seeds: Vec<ChainSeed> = titles
            .iter()
            .map(|title| ChainSeed::redirect(title, namespace))
            .collect();
        match self.retry_portion(&label, |runner| {
            let task = MovedPagesTask::new(&runner.sites, &runner.conformity, &runner.fetcher);
            task.process_seeds(&mut runner.client, code, &seeds)
        }) {
            PortionOutcome::Done(moves) => {
                report.moves.push(moves);
                true
            }
            PortionOutcome::Abandoned(message) => {
                report.abandoned.push(message);
                true
            }
            PortionOutcome::Cancelled => {
                report.cancelled = true;
                false
            }
        }
    }

    fn retry_portion<T, F>(&mut self, label: &str, mut run: F) -> PortionOutcome<T>
    where
        F: FnMut(&mut Self) -> FetchResult<T>,
    {
        let attempts = self.settings.retry.portion_attempts.max(1);
        for attempt in 1..=attempts {
            if self.fetcher.cancel_token().is_cancelled() {
                return PortionOutcome::Cancelled;
            }
            match run(self) {
                Ok(value) => return PortionOutcome::Done(value),
                Err(FetchError::Cancelled) => {
                    tracing::warn!(portion = label, "portion cancelled, nothing written");
                    return PortionOutcome::Cancelled;
                }
                Err(error) if error.is_transient() && attempt < attempts => {
                    tracing::warn!(portion = label, attempt, %error, "retrying portion");
                    sleep(self.settings.retry.portion_pause);
                }
                Err(error) => {
                    let message = format!("Abandoned {label} after {attempt} attempt(s): {error}");
                    tracing::error!("{message}");
                    return PortionOutcome::Abandoned(message);
                }
            }
        }
        PortionOutcome::Abandoned(format!("Abandoned {label}"))
    }
}
