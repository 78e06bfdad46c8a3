//! Migration planning and execution.

use crate::error::MigrateError;
use crate::migration::Migration;
use crate::store::MigrationStore;
use futures::future::join_all;
use multiverse_cluster::ClusterManager;
use multiverse_core::events::{Event, EventBus};
use multiverse_core::types::{Operation, QueryOptions};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use uuid::Uuid;

const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_MAX_PARALLEL: usize = 4;

#[derive(Debug, Clone)]
pub struct MigrateOptions {
    /// Apply only migrations with `version <= target_version`.
    pub target_version: Option<String>,
    pub schemas: Option<Vec<String>>,
    pub clusters: Option<Vec<String>>,
    pub dry_run: bool,
    /// Skip the dependency check.
    pub force: bool,
    pub continue_on_error: bool,
    pub parallel: bool,
    pub max_parallel: usize,
    pub lock_timeout: Duration,
}

impl Default for MigrateOptions {
    fn default() -> Self {
        Self {
            target_version: None,
            schemas: None,
            clusters: None,
            dry_run: false,
            force: false,
            continue_on_error: false,
            parallel: false,
            max_parallel: DEFAULT_MAX_PARALLEL,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RollbackOptions {
    /// Roll back every migration with `version > target_version`.
    pub target_version: Option<String>,
    /// Without a target version, undo this many migrations per target.
    pub steps: usize,
    pub schemas: Option<Vec<String>>,
    pub clusters: Option<Vec<String>>,
    pub dry_run: bool,
    /// Skip rows whose migration object is no longer registered.
    pub force: bool,
}

impl Default for RollbackOptions {
    fn default() -> Self {
        Self {
            target_version: None,
            steps: 1,
            schemas: None,
            clusters: None,
            dry_run: false,
            force: false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    pub schemas: Vec<String>,
    pub clusters: Option<Vec<String>>,
    pub description: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AppliedMigration {
    pub version: String,
    pub name: String,
    pub schema: String,
    pub cluster_id: String,
    pub checksum: String,
    pub batch: i64,
    pub execution_time: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingMigration {
    pub version: String,
    pub name: String,
    pub schema: String,
    pub cluster_id: String,
}

#[derive(Debug, Clone)]
pub struct MigrationIssue {
    pub version: String,
    pub schema: String,
    pub cluster_id: String,
    pub error: String,
}

#[derive(Debug, Clone, Default)]
pub struct MigrationStatus {
    pub applied_migrations: Vec<AppliedMigration>,
    pub pending_migrations: Vec<PendingMigration>,
    pub errors: Vec<MigrationIssue>,
}

#[derive(Clone)]
struct PlanItem {
    migration: Migration,
    schema: String,
    cluster_id: String,
}

pub struct MigrationManager {
    registry: RwLock<BTreeMap<String, Migration>>,
    dir: PathBuf,
    store: MigrationStore,
    manager: Arc<ClusterManager>,
    events: EventBus,
    instance_id: String,
    initialized: AtomicBool,
}

impl MigrationManager {
    pub fn new(manager: Arc<ClusterManager>, dir: impl Into<PathBuf>, events: EventBus) -> Self {
        Self {
            registry: RwLock::new(BTreeMap::new()),
            dir: dir.into(),
            store: MigrationStore::new(manager.clone()),
            manager,
            events,
            instance_id: Uuid::new_v4().to_string(),
            initialized: AtomicBool::new(false),
        }
    }

    pub fn migrations_dir(&self) -> &Path {
        &self.dir
    }

    fn ensure_initialized(&self) -> Result<(), MigrateError> {
        if self.initialized.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(MigrateError::NotInitialized)
        }
    }

    /// Ensure persistence tables exist on every cluster, then load the
    /// migrations directory.
    pub async fn initialize(&self) -> Result<(), MigrateError> {
        for cluster_id in self.manager.cluster_ids().await {
            self.store.ensure_tables(&cluster_id).await?;
        }
        self.load_directory().await?;
        self.initialized.store(true, Ordering::Release);
        Ok(())
    }

    /// Read `*.json` migration files into the registry. A missing
    /// directory is not an error.
    pub async fn load_directory(&self) -> Result<usize, MigrateError> {
        let mut dir = match tokio::fs::read_dir(&self.dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut loaded = 0usize;
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let content = tokio::fs::read_to_string(&path).await?;
            let migration: Migration = serde_json::from_str(&content).map_err(|e| {
                MigrateError::Invalid(format!("{}: {e}", path.display()))
            })?;
            migration.validate()?;
            self.registry
                .write()
                .await
                .insert(migration.version.clone(), migration);
            loaded += 1;
        }
        tracing::info!(count = loaded, dir = %self.dir.display(), "migrations loaded");
        Ok(loaded)
    }

    pub async fn add_migration(&self, migration: Migration) -> Result<(), MigrateError> {
        migration.validate()?;
        let mut registry = self.registry.write().await;
        if registry.contains_key(&migration.version) {
            return Err(MigrateError::Invalid(format!(
                "migration '{}' is already registered",
                migration.version
            )));
        }
        registry.insert(migration.version.clone(), migration);
        Ok(())
    }

    pub async fn remove_migration(&self, version: &str) -> Result<(), MigrateError> {
        self.registry
            .write()
            .await
            .remove(version)
            .map(|_| ())
            .ok_or_else(|| MigrateError::NotFound(version.to_string()))
    }

    /// Registered migrations in version order.
    pub async fn get_migrations(&self) -> Vec<Migration> {
        self.registry.read().await.values().cloned().collect()
    }

    /// Write a migration template to disk and register it.
    pub async fn create_migration(
        &self,
        name: &str,
        options: CreateOptions,
    ) -> Result<PathBuf, MigrateError> {
        let slug: String = name
            .to_lowercase()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        let version = format!("{}_{}", chrono::Utc::now().format("%Y%m%d%H%M%S"), slug);

        let migration = Migration {
            version: version.clone(),
            name: name.to_string(),
            description: options.description,
            target_schemas: options.schemas,
            target_clusters: options.clusters,
            up: "-- forward migration SQL".to_string(),
            down: "-- rollback SQL".to_string(),
            dependencies: vec![],
            tags: vec![],
            created_at: Some(chrono::Utc::now()),
        };
        migration.validate()?;

        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.dir.join(migration.file_name());
        tokio::fs::write(&path, serde_json::to_string_pretty(&migration)?).await?;
        self.registry.write().await.insert(version, migration);
        tracing::info!(path = %path.display(), "migration created");
        Ok(path)
    }

    /// The (schema, cluster) pairs a run covers.
    async fn targets(
        &self,
        schemas: &Option<Vec<String>>,
        clusters: &Option<Vec<String>>,
    ) -> Result<Vec<(String, String)>, MigrateError> {
        let schemas = match schemas {
            Some(schemas) => schemas.clone(),
            None => self.manager.schemas().await,
        };
        let mut targets = Vec::new();
        for schema in schemas {
            let cluster_id = self.manager.schema_cluster(&schema).await.ok_or_else(|| {
                MigrateError::Cluster(multiverse_cluster::ClusterError::UnknownSchema(
                    schema.clone(),
                ))
            })?;
            if let Some(filter) = clusters {
                if !filter.contains(&cluster_id) {
                    continue;
                }
            }
            targets.push((schema, cluster_id));
        }
        Ok(targets)
    }

    fn check_dependencies(
        plan: &[PlanItem],
        applied: &HashMap<(String, String), HashSet<String>>,
        registry: &BTreeMap<String, Migration>,
        force: bool,
    ) -> Result<(), MigrateError> {
        for item in plan {
            for dependency in &item.migration.dependencies {
                let in_plan = plan.iter().any(|p| {
                    p.migration.version == *dependency && *dependency < item.migration.version
                });
                if in_plan {
                    continue;
                }

                let satisfied = match registry.get(dependency) {
                    Some(dep) => {
                        // Applied in every targeted lane covering one of
                        // the dependency's schemas.
                        let mut lanes = applied
                            .iter()
                            .filter(|((schema, _), _)| dep.targets_schema(schema))
                            .peekable();
                        if lanes.peek().is_none() {
                            applied
                                .get(&(item.schema.clone(), item.cluster_id.clone()))
                                .map(|set| set.contains(dependency))
                                .unwrap_or(false)
                        } else {
                            lanes.all(|(_, set)| set.contains(dependency))
                        }
                    }
                    None => applied
                        .get(&(item.schema.clone(), item.cluster_id.clone()))
                        .map(|set| set.contains(dependency))
                        .unwrap_or(false),
                };

                if !satisfied {
                    if force {
                        tracing::warn!(
                            version = %item.migration.version,
                            dependency = %dependency,
                            "dependency missing, continuing because of force"
                        );
                        continue;
                    }
                    return Err(MigrateError::DependencyMissing {
                        version: item.migration.version.clone(),
                        dependency: dependency.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Plan and run pending migrations.
    pub async fn migrate(&self, options: &MigrateOptions) -> Result<MigrationStatus, MigrateError> {
        self.ensure_initialized()?;
        let targets = self.targets(&options.schemas, &options.clusters).await?;
        let registry = self.registry.read().await.clone();

        let mut plan: Vec<PlanItem> = Vec::new();
        let mut applied: HashMap<(String, String), HashSet<String>> = HashMap::new();
        for (schema, cluster_id) in &targets {
            let versions: HashSet<String> = self
                .store
                .applied_versions(schema, cluster_id)
                .await?
                .into_iter()
                .collect();

            for migration in registry.values() {
                if !migration.targets_schema(schema) || !migration.targets_cluster(cluster_id) {
                    continue;
                }
                if versions.contains(&migration.version) {
                    continue;
                }
                if let Some(target) = &options.target_version {
                    if migration.version > *target {
                        continue;
                    }
                }
                plan.push(PlanItem {
                    migration: migration.clone(),
                    schema: schema.clone(),
                    cluster_id: cluster_id.clone(),
                });
            }
            applied.insert((schema.clone(), cluster_id.clone()), versions);
        }
        plan.sort_by(|a, b| {
            (&a.migration.version, &a.schema, &a.cluster_id)
                .cmp(&(&b.migration.version, &b.schema, &b.cluster_id))
        });

        Self::check_dependencies(&plan, &applied, &registry, options.force)?;

        let mut status = MigrationStatus::default();
        if options.dry_run {
            status.pending_migrations = plan
                .iter()
                .map(|item| PendingMigration {
                    version: item.migration.version.clone(),
                    name: item.migration.name.clone(),
                    schema: item.schema.clone(),
                    cluster_id: item.cluster_id.clone(),
                })
                .collect();
            return Ok(status);
        }

        // One batch number per lane for the whole run.
        let mut batches: HashMap<(String, String), i64> = HashMap::new();
        for item in &plan {
            let lane = (item.schema.clone(), item.cluster_id.clone());
            if !batches.contains_key(&lane) {
                let batch = self.store.next_batch(&item.schema, &item.cluster_id).await?;
                batches.insert(lane, batch);
            }
        }

        if options.parallel {
            self.run_parallel(plan, &batches, options, &mut status).await?;
        } else {
            for item in plan {
                let lane = (item.schema.clone(), item.cluster_id.clone());
                let batch = batches.get(&lane).copied().unwrap_or(1);
                match self.execute_one(&item, options.lock_timeout, batch).await {
                    Ok(done) => status.applied_migrations.push(done),
                    Err(e) => {
                        if options.continue_on_error {
                            status.errors.push(MigrationIssue {
                                version: item.migration.version.clone(),
                                schema: item.schema.clone(),
                                cluster_id: item.cluster_id.clone(),
                                error: e.to_string(),
                            });
                        } else {
                            return Err(e);
                        }
                    }
                }
            }
        }
        Ok(status)
    }

    /// Group the plan into (schema, cluster) lanes that run sequentially,
    /// then run lanes in batches of `max_parallel`.
    async fn run_parallel(
        &self,
        plan: Vec<PlanItem>,
        batches: &HashMap<(String, String), i64>,
        options: &MigrateOptions,
        status: &mut MigrationStatus,
    ) -> Result<(), MigrateError> {
        let mut lanes: BTreeMap<(String, String), Vec<PlanItem>> = BTreeMap::new();
        for item in plan {
            lanes
                .entry((item.schema.clone(), item.cluster_id.clone()))
                .or_default()
                .push(item);
        }

        let lanes: Vec<((String, String), Vec<PlanItem>)> = lanes.into_iter().collect();
        for chunk in lanes.chunks(options.max_parallel.max(1)) {
            let futures = chunk.iter().map(|(lane, items)| {
                let batch = batches.get(lane).copied().unwrap_or(1);
                async move {
                    let mut applied = Vec::new();
                    let mut issues = Vec::new();
                    for item in items {
                        match self.execute_one(item, options.lock_timeout, batch).await {
                            Ok(done) => applied.push(done),
                            Err(e) => {
                                issues.push(MigrationIssue {
                                    version: item.migration.version.clone(),
                                    schema: item.schema.clone(),
                                    cluster_id: item.cluster_id.clone(),
                                    error: e.to_string(),
                                });
                                if !options.continue_on_error {
                                    return (applied, issues, Some(e));
                                }
                            }
                        }
                    }
                    (applied, issues, None)
                }
            });

            for (applied, issues, fatal) in join_all(futures).await {
                status.applied_migrations.extend(applied);
                status.errors.extend(issues);
                if let Some(e) = fatal {
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Run SQL on a specific (schema, cluster), with the search path
    /// pinned so unqualified DDL lands in the target schema.
    async fn run_sql(
        &self,
        schema: &str,
        cluster_id: &str,
        sql: &str,
    ) -> Result<(), MigrateError> {
        let opts = QueryOptions {
            cluster_id: Some(cluster_id.to_string()),
            schema: Some(schema.to_string()),
            operation: Some(Operation::Write),
            ..Default::default()
        };
        let mut conn = self.manager.get_connection(&opts).await?;
        conn.execute_raw(&format!("SET search_path TO \"{schema}\", public"))
            .await?;
        conn.execute_raw(sql).await?;
        Ok(())
    }

    async fn acquire_locks(
        &self,
        lock_key: &str,
        target_cluster: &str,
        ttl: Duration,
    ) -> Result<Vec<String>, MigrateError> {
        let mut locked = Vec::new();
        for cluster_id in self.manager.cluster_ids().await {
            match self
                .store
                .acquire_lock(&cluster_id, lock_key, &self.instance_id, ttl)
                .await
            {
                Ok(true) => locked.push(cluster_id),
                Ok(false) => {
                    if cluster_id == target_cluster {
                        self.release_locks(lock_key, &locked).await;
                        return Err(MigrateError::LockFailed(lock_key.to_string()));
                    }
                    tracing::warn!(
                        cluster_id = %cluster_id,
                        lock_key = %lock_key,
                        "lock held elsewhere on non-target cluster"
                    );
                }
                Err(e) => {
                    if cluster_id == target_cluster {
                        self.release_locks(lock_key, &locked).await;
                        return Err(e);
                    }
                    tracing::warn!(
                        cluster_id = %cluster_id,
                        lock_key = %lock_key,
                        "lock fan-out failed on non-target cluster: {}",
                        e
                    );
                }
            }
        }
        Ok(locked)
    }

    async fn release_locks(&self, lock_key: &str, clusters: &[String]) {
        for cluster_id in clusters {
            if let Err(e) = self
                .store
                .release_lock(cluster_id, lock_key, &self.instance_id)
                .await
            {
                tracing::warn!(
                    cluster_id = %cluster_id,
                    lock_key = %lock_key,
                    "lock release failed: {}",
                    e
                );
            }
        }
    }

    async fn execute_one(
        &self,
        item: &PlanItem,
        lock_timeout: Duration,
        batch: i64,
    ) -> Result<AppliedMigration, MigrateError> {
        let migration = &item.migration;
        let lock_key = format!("{}-{}-{}", migration.version, item.schema, item.cluster_id);
        let locked = self
            .acquire_locks(&lock_key, &item.cluster_id, lock_timeout)
            .await?;

        self.events.emit(Event::MigrationStarted {
            version: migration.version.clone(),
            schema: item.schema.clone(),
            cluster_id: item.cluster_id.clone(),
        });
        tracing::info!(
            version = %migration.version,
            schema = %item.schema,
            cluster_id = %item.cluster_id,
            "running migration"
        );

        let started = Instant::now();
        let run = async {
            self.run_sql(&item.schema, &item.cluster_id, &migration.up)
                .await?;
            let execution_time = started.elapsed();
            self.store
                .record_applied(migration, &item.schema, &item.cluster_id, execution_time, batch)
                .await?;
            Ok::<Duration, MigrateError>(execution_time)
        };

        let result = run.await;
        self.release_locks(&lock_key, &locked).await;

        match result {
            Ok(execution_time) => {
                self.events.emit(Event::MigrationCompleted {
                    version: migration.version.clone(),
                    schema: item.schema.clone(),
                    cluster_id: item.cluster_id.clone(),
                    execution_time,
                });
                Ok(AppliedMigration {
                    version: migration.version.clone(),
                    name: migration.name.clone(),
                    schema: item.schema.clone(),
                    cluster_id: item.cluster_id.clone(),
                    checksum: migration.checksum(),
                    batch,
                    execution_time,
                })
            }
            Err(e) => {
                self.events.emit(Event::MigrationFailed {
                    version: migration.version.clone(),
                    schema: item.schema.clone(),
                    cluster_id: item.cluster_id.clone(),
                    error: e.to_string(),
                });
                Err(MigrateError::ExecutionFailed {
                    version: migration.version.clone(),
                    schema: item.schema.clone(),
                    cluster_id: item.cluster_id.clone(),
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Undo applied migrations, newest first.
    pub async fn rollback(
        &self,
        options: &RollbackOptions,
    ) -> Result<MigrationStatus, MigrateError> {
        self.ensure_initialized()?;
        let targets = self.targets(&options.schemas, &options.clusters).await?;
        let registry = self.registry.read().await.clone();
        let mut status = MigrationStatus::default();

        for (schema, cluster_id) in targets {
            let records = self.store.applied_records(&schema, &cluster_id).await?;
            let selected: Vec<_> = match &options.target_version {
                Some(target) => records
                    .into_iter()
                    .filter(|r| r.version > *target)
                    .collect(),
                None => records.into_iter().take(options.steps).collect(),
            };

            for record in selected {
                let migration = match registry.get(&record.version) {
                    Some(migration) => migration,
                    None if options.force => {
                        tracing::warn!(
                            version = %record.version,
                            "no migration object for applied row, skipping (force)"
                        );
                        continue;
                    }
                    None => return Err(MigrateError::NotFound(record.version.clone())),
                };

                if options.dry_run {
                    status.pending_migrations.push(PendingMigration {
                        version: record.version.clone(),
                        name: record.name.clone(),
                        schema: schema.clone(),
                        cluster_id: cluster_id.clone(),
                    });
                    continue;
                }

                self.events.emit(Event::RollbackStarted {
                    version: record.version.clone(),
                    schema: schema.clone(),
                    cluster_id: cluster_id.clone(),
                });

                let started = Instant::now();
                let run = async {
                    self.run_sql(&schema, &cluster_id, &migration.down).await?;
                    self.store
                        .delete_record(&record.version, &schema, &cluster_id)
                        .await?;
                    Ok::<(), MigrateError>(())
                };
                match run.await {
                    Ok(()) => {
                        self.events.emit(Event::RollbackCompleted {
                            version: record.version.clone(),
                            schema: schema.clone(),
                            cluster_id: cluster_id.clone(),
                        });
                        status.applied_migrations.push(AppliedMigration {
                            version: record.version.clone(),
                            name: record.name.clone(),
                            schema: schema.clone(),
                            cluster_id: cluster_id.clone(),
                            checksum: record.checksum.clone(),
                            batch: record.batch,
                            execution_time: started.elapsed(),
                        });
                    }
                    Err(e) => {
                        self.events.emit(Event::RollbackFailed {
                            version: record.version.clone(),
                            schema: schema.clone(),
                            cluster_id: cluster_id.clone(),
                            error: e.to_string(),
                        });
                        return Err(e);
                    }
                }
            }
        }
        Ok(status)
    }

    /// Applied and pending migrations across the given targets.
    pub async fn get_status(
        &self,
        schemas: Option<Vec<String>>,
        clusters: Option<Vec<String>>,
    ) -> Result<MigrationStatus, MigrateError> {
        self.ensure_initialized()?;
        let targets = self.targets(&schemas, &clusters).await?;
        let registry = self.registry.read().await.clone();
        let mut status = MigrationStatus::default();

        for (schema, cluster_id) in targets {
            let records = self.store.applied_records(&schema, &cluster_id).await?;
            let applied: HashSet<String> = records.iter().map(|r| r.version.clone()).collect();

            for record in records.iter().rev() {
                status.applied_migrations.push(AppliedMigration {
                    version: record.version.clone(),
                    name: record.name.clone(),
                    schema: schema.clone(),
                    cluster_id: cluster_id.clone(),
                    checksum: record.checksum.clone(),
                    batch: record.batch,
                    execution_time: Duration::from_millis(record.execution_time.max(0) as u64),
                });
            }
            for migration in registry.values() {
                if migration.targets_schema(&schema)
                    && migration.targets_cluster(&cluster_id)
                    && !applied.contains(&migration.version)
                {
                    status.pending_migrations.push(PendingMigration {
                        version: migration.version.clone(),
                        name: migration.name.clone(),
                        schema: schema.clone(),
                        cluster_id: cluster_id.clone(),
                    });
                }
            }
        }
        Ok(status)
    }

    pub async fn close(&self) {
        self.initialized.store(false, Ordering::Release);
    }
}
