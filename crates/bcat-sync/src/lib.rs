//! Harvest pipeline orchestration: sample terms, page through the search API,
//! resolve identities, merge and write.

pub mod config;
pub mod identity;
pub mod terms;
pub mod writer;

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use bcat_adapters::{BookSearchClient, PageRequest, Pagination, SearchSource};
use bcat_core::{FetchedItem, SortOrder, Term, TermSource, MANUAL_PROVENANCE, SCHEDULED_PROVENANCE};
use bcat_storage::{BookStore, PgBookStore};
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub use config::{ConfigError, DatabaseConfig, HarvestConfig, HarvestMode};
pub use identity::{IdentityResolver, MergedPage, Observation, Resolution, UpsertMergeEngine};
pub use terms::{TermSampler, TermStrategy, FALLBACK_TERMS};
pub use writer::SchemaAdaptiveWriter;

/// Run-shaping knobs, separated from connection details.
#[derive(Debug, Clone)]
pub struct HarvestSettings {
    pub mode: HarvestMode,
    pub batch_size: usize,
    pub sample_size: usize,
    pub page_size: usize,
    pub requests_per_term: Option<usize>,
    pub both_sorts: bool,
}

impl HarvestSettings {
    pub fn from_config(config: &HarvestConfig) -> Self {
        Self {
            mode: config.mode.clone(),
            batch_size: config.batch_size,
            sample_size: config.sample_size,
            page_size: config.page_size,
            requests_per_term: Some(config.requests_per_term),
            both_sorts: config.both_sorts,
        }
    }
}

impl Default for HarvestSettings {
    fn default() -> Self {
        Self {
            mode: HarvestMode::Sampled(TermStrategy::Title),
            batch_size: 5,
            sample_size: 100,
            page_size: bcat_adapters::MAX_PAGE_SIZE,
            requests_per_term: None,
            both_sorts: false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HarvestRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub mode: &'static str,
    pub terms: Vec<Term>,
    pub loops: usize,
    pub pages_fetched: usize,
    pub items_fetched: usize,
    pub records_written: u64,
    pub new_identities: usize,
    pub carried_identities: usize,
    pub dropped_items: usize,
    pub abandoned_loops: usize,
    pub degraded_resolutions: usize,
}

/// One planned term with the sort orders to page through.
#[derive(Debug, Clone, PartialEq)]
struct TermPlan {
    term: Term,
    sorts: Vec<SortOrder>,
    /// Page budget per sort order; `None` walks the whole result window.
    page_budget: Option<usize>,
}

#[derive(Debug, Default)]
struct RunCounters {
    loops: usize,
    pages_fetched: usize,
    items_fetched: usize,
    records_written: u64,
    new_identities: usize,
    carried_identities: usize,
    dropped_items: usize,
    abandoned_loops: usize,
    degraded_resolutions: usize,
}

pub struct HarvestPipeline {
    settings: HarvestSettings,
    search: Arc<dyn SearchSource>,
    sampler: TermSampler,
    resolver: IdentityResolver,
    merger: UpsertMergeEngine,
    writer: SchemaAdaptiveWriter,
}

impl HarvestPipeline {
    /// Reads the destination column set once; every component shares it.
    pub async fn new(
        settings: HarvestSettings,
        store: Arc<dyn BookStore>,
        search: Arc<dyn SearchSource>,
    ) -> Result<Self> {
        let columns = store
            .list_columns()
            .await
            .context("listing destination columns")?;
        if columns.is_empty() {
            bail!("destination table reports no columns; check that it exists");
        }

        let ingest_provenance = match settings.mode {
            HarvestMode::Manual(_) => MANUAL_PROVENANCE,
            HarvestMode::Sampled(_) | HarvestMode::Mixed => SCHEDULED_PROVENANCE,
        };

        Ok(Self {
            sampler: TermSampler::new(store.clone()),
            resolver: IdentityResolver::new(store.clone(), &columns),
            merger: UpsertMergeEngine::new(ingest_provenance),
            writer: SchemaAdaptiveWriter::new(store, columns),
            search,
            settings,
        })
    }

    pub async fn run_once(&self) -> Result<HarvestRunSummary> {
        let mut rng = StdRng::from_rng(&mut rand::rng());
        self.run_once_with_rng(&mut rng).await
    }

    pub async fn run_once_with_rng<R>(&self, rng: &mut R) -> Result<HarvestRunSummary>
    where
        R: Rng + ?Sized,
    {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let span = info_span!("harvest_run", %run_id, mode = self.settings.mode.sampling_mode().as_str());

        async move {
            let plan = self.plan(rng).await;
            let mut counters = RunCounters::default();

            for entry in &plan {
                for sort in &entry.sorts {
                    self.harvest_term(&entry.term, *sort, entry.page_budget, &mut counters)
                        .await?;
                }
            }

            let summary = HarvestRunSummary {
                run_id,
                started_at,
                finished_at: Utc::now(),
                mode: self.settings.mode.sampling_mode().as_str(),
                terms: plan.into_iter().map(|entry| entry.term).collect(),
                loops: counters.loops,
                pages_fetched: counters.pages_fetched,
                items_fetched: counters.items_fetched,
                records_written: counters.records_written,
                new_identities: counters.new_identities,
                carried_identities: counters.carried_identities,
                dropped_items: counters.dropped_items,
                abandoned_loops: counters.abandoned_loops,
                degraded_resolutions: counters.degraded_resolutions,
            };
            info!(
                terms = summary.terms.len(),
                pages = summary.pages_fetched,
                written = summary.records_written,
                new = summary.new_identities,
                carried = summary.carried_identities,
                abandoned = summary.abandoned_loops,
                degraded = summary.degraded_resolutions,
                "harvest run complete"
            );
            Ok(summary)
        }
        .instrument(span)
        .await
    }

    /// Terms for this run. Only sampled terms are held to the per-term page
    /// budget; mixed and manual runs cover the full result window.
    async fn plan<R>(&self, rng: &mut R) -> Vec<TermPlan>
    where
        R: Rng + ?Sized,
    {
        match &self.settings.mode {
            HarvestMode::Sampled(strategy) => {
                let terms = self
                    .sampler
                    .sample(
                        *strategy,
                        self.settings.batch_size,
                        self.settings.sample_size,
                        rng,
                    )
                    .await;
                terms
                    .into_iter()
                    .map(|term| {
                        let sorts = if self.settings.both_sorts {
                            SortOrder::ALL.to_vec()
                        } else {
                            vec![SortOrder::ALL[rng.random_range(0..SortOrder::ALL.len())]]
                        };
                        TermPlan {
                            term,
                            sorts,
                            page_budget: self.settings.requests_per_term,
                        }
                    })
                    .collect()
            }
            HarvestMode::Mixed => {
                let term = self.sampler.sample_one(self.settings.sample_size, rng).await;
                vec![TermPlan {
                    term,
                    sorts: SortOrder::ALL.to_vec(),
                    page_budget: None,
                }]
            }
            HarvestMode::Manual(keyword) => vec![TermPlan {
                term: Term::new(keyword.clone(), TermSource::Manual),
                sorts: SortOrder::ALL.to_vec(),
                page_budget: None,
            }],
        }
    }

    /// Page through one (term, sort) pair. Fetch failures end the loop; write
    /// failures abort the run.
    async fn harvest_term(
        &self,
        term: &Term,
        sort: SortOrder,
        page_budget: Option<usize>,
        counters: &mut RunCounters,
    ) -> Result<()> {
        let span = info_span!("harvest_term", term = %term.text, source = term.source.as_str(), sort = sort.api_value());

        async move {
            counters.loops += 1;
            let mut pagination = Pagination::new(self.settings.page_size, page_budget);

            while let Some(start) = pagination.next_start() {
                let request = PageRequest {
                    term: term.text.clone(),
                    sort,
                    start,
                    display: pagination.page_size(),
                };

                let items = match self.search.fetch_page(&request).await {
                    Ok(items) => items,
                    Err(err) => {
                        warn!(
                            error = %err,
                            start,
                            rate_limited = err.is_rate_limited(),
                            "search page failed; abandoning this term/sort"
                        );
                        counters.abandoned_loops += 1;
                        break;
                    }
                };
                counters.pages_fetched += 1;
                counters.items_fetched += items.len();
                if items.is_empty() {
                    break;
                }

                let written = self.process_page(term, sort, start, &items, counters).await?;
                debug!(start, fetched = items.len(), written, "page processed");
                pagination.advance(items.len());
            }
            Ok(())
        }
        .instrument(span)
        .await
    }

    async fn process_page(
        &self,
        term: &Term,
        sort: SortOrder,
        start: usize,
        items: &[FetchedItem],
        counters: &mut RunCounters,
    ) -> Result<u64> {
        let observation = Observation::new(
            Utc::now(),
            self.settings.mode.sampling_mode(),
            &term.text,
            sort,
        );

        let keys: Vec<String> = items
            .iter()
            .filter_map(FetchedItem::natural_key)
            .map(str::to_string)
            .collect();
        let resolution = self.resolver.resolve(&keys).await;
        if resolution.is_degraded() {
            counters.degraded_resolutions += 1;
        }

        let merged = self.merger.merge_page(items, &resolution, &observation);
        counters.new_identities += merged.new_identities;
        counters.carried_identities += merged.carried_identities;
        counters.dropped_items += merged.dropped_items;

        let written = self
            .writer
            .write_page(&merged.records)
            .await
            .with_context(|| {
                format!(
                    "writing page start={start} for term `{}` sort={}",
                    term.text,
                    sort.api_value()
                )
            })?;
        counters.records_written += written;
        Ok(written)
    }
}

/// Build the Postgres-backed pipeline from the environment and run it once.
pub async fn run_harvest_once_from_env() -> Result<HarvestRunSummary> {
    let config = HarvestConfig::from_env()?;
    config.log_redacted();

    let table = config.database.table_ref()?;
    let store = PgBookStore::connect(&config.database.database_url, table)
        .await
        .context("connecting to destination database")?;
    let search = BookSearchClient::new(config.search_client_config(), config.credentials.clone())?;

    let pipeline = HarvestPipeline::new(
        HarvestSettings::from_config(&config),
        Arc::new(store),
        Arc::new(search),
    )
    .await?;
    pipeline.run_once().await
}

/// Apply the bundled migrations using only the database settings.
pub async fn migrate_from_env() -> Result<()> {
    let database = DatabaseConfig::from_env()?;
    let store = PgBookStore::connect(&database.database_url, database.table_ref()?)
        .await
        .context("connecting to destination database")?;
    store.migrate().await.context("running migrations")?;
    info!(table = %store.table().qualified(), "migrations applied");
    Ok(())
}
