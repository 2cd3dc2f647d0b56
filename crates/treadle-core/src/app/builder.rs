//! JobStoreBuilder - JobStore の構築とワイヤリング
//!
//! # 学習ポイント
//! - Builder パターンの実装
//! - 起動時検証（Fail-fast 設計）
//! - 注入された 1 つの `Arc<dyn Store>` を全コンポーネントで共有する

use std::sync::Arc;

use super::acquirer::Acquirer;
use super::fire_cycle::FireCycle;
use super::job_store::JobStore;
use super::misfire::MisfirePolicy;
use super::persister::Persister;
use super::state_manager::StateManager;
use crate::cluster::{
    CheckinErrorHandler, ExpiryPolicy, FatalCheckinHandler, LeaseLock, LivenessRegistry, Recoverer,
};
use crate::config::StoreConfig;
use crate::dao::{CalendarDao, JobDao, PausedGroups, TriggerLedger};
use crate::domain::PersistenceError;
use crate::impls::RetryingStore;
use crate::ports::{Clock, IdGenerator, Store, SystemClock, UlidGenerator};
use crate::typed::{JobKind, JobTypeDescriptor, JobTypeRegistry, RegistryError};

/// JobStoreBuilder は JobStore を構築
///
/// # 使用例
/// ```ignore
/// let job_store = JobStoreBuilder::new(StoreConfig::new("node-a").with_clustered(true))
///     .store(Arc::new(InMemoryStore::new()))
///     .register_job_type::<NightlyReport>()?
///     .expect_job_types(&["reports.nightly.v1"])
///     .build()?;
/// ```
///
/// # Fail-fast 設計
/// - 設定値は build() 時に検証
/// - expect_job_types() の集合が登録済みでなければ BuildError
/// - ストア未指定も BuildError
pub struct JobStoreBuilder {
    config: StoreConfig,
    store: Option<Arc<dyn Store>>,
    clock: Arc<dyn Clock>,
    ids: Option<Arc<dyn IdGenerator>>,
    registry: JobTypeRegistry,
    expected_job_types: Option<Vec<String>>,
    checkin_handler: Arc<dyn CheckinErrorHandler>,
}

/// BuildError は JobStore 構築時のエラー
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Missing job types: {0:?}. These job types were expected but not registered.")]
    MissingJobTypes(Vec<String>),
    #[error("no store was configured")]
    MissingStore,
    #[error(transparent)]
    Config(#[from] PersistenceError),
}

impl JobStoreBuilder {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            config,
            store: None,
            clock: Arc::new(SystemClock),
            ids: None,
            registry: JobTypeRegistry::new(),
            expected_job_types: None,
            checkin_handler: Arc::new(FatalCheckinHandler),
        }
    }

    pub fn store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Defaults to ULIDs stamped with the configured clock.
    pub fn id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    pub fn register_job_type<K: JobKind>(mut self) -> Result<Self, RegistryError> {
        self.registry.register::<K>()?;
        Ok(self)
    }

    pub fn register_descriptor(mut self, descriptor: JobTypeDescriptor) -> Result<Self, RegistryError> {
        self.registry.register_descriptor(descriptor)?;
        Ok(self)
    }

    /// 期待される job_type のリストを設定
    pub fn expect_job_types(mut self, job_types: &[&str]) -> Self {
        self.expected_job_types = Some(job_types.iter().map(|t| t.to_string()).collect());
        self
    }

    pub fn checkin_error_handler(mut self, handler: Arc<dyn CheckinErrorHandler>) -> Self {
        self.checkin_handler = handler;
        self
    }

    pub fn build(self) -> Result<JobStore, BuildError> {
        Ok(JobStore::new(self.build_components()?))
    }

    pub(crate) fn build_components(self) -> Result<Components, BuildError> {
        self.config.validate()?;
        if let Some(expected) = &self.expected_job_types {
            let registered = self.registry.registered_types();
            let missing: Vec<String> = expected
                .iter()
                .filter(|job_type| !registered.contains(job_type))
                .cloned()
                .collect();
            if !missing.is_empty() {
                return Err(BuildError::MissingJobTypes(missing));
            }
        }
        let inner = self.store.ok_or(BuildError::MissingStore)?;
        let store: Arc<dyn Store> = Arc::new(RetryingStore::new(inner));
        let ids: Arc<dyn IdGenerator> = match self.ids {
            Some(ids) => ids,
            None => Arc::new(UlidGenerator::new(self.clock.clone())),
        };
        Ok(Components::wire(
            self.config,
            store,
            self.clock,
            ids,
            Arc::new(self.registry),
            self.checkin_handler,
        ))
    }
}

/// Every component of one node, sharing one store handle.
#[derive(Clone)]
pub(crate) struct Components {
    pub config: StoreConfig,
    pub clock: Arc<dyn Clock>,
    pub liveness: LivenessRegistry,
    pub locks: LeaseLock,
    pub jobs: JobDao,
    pub triggers: TriggerLedger,
    pub calendars: CalendarDao,
    pub paused_trigger_groups: PausedGroups,
    pub paused_job_groups: PausedGroups,
    pub registry: Arc<JobTypeRegistry>,
    pub persister: Persister,
    pub acquirer: Acquirer,
    pub fire_cycle: FireCycle,
    pub state_manager: StateManager,
    pub recoverer: Recoverer,
    pub checkin_handler: Arc<dyn CheckinErrorHandler>,
}

impl Components {
    fn wire(
        config: StoreConfig,
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
        registry: Arc<JobTypeRegistry>,
        checkin_handler: Arc<dyn CheckinErrorHandler>,
    ) -> Self {
        let liveness = LivenessRegistry::new(
            store.clone(),
            clock.clone(),
            config.scheduler_name.clone(),
            config.instance_id.clone(),
            config.checkin_interval,
            config.defunct_multiplier,
        );
        let expiry = ExpiryPolicy::new(
            clock.clone(),
            liveness.clone(),
            config.job_timeout,
            config.trigger_timeout,
            config.missing_liveness,
        );
        let locks = LeaseLock::new(store.clone(), clock.clone(), expiry, config.instance_id.clone());
        let jobs = JobDao::new(store.clone());
        let triggers = TriggerLedger::new(store.clone());
        let calendars = CalendarDao::new(store.clone());
        let paused_trigger_groups = PausedGroups::triggers(store.clone());
        let paused_job_groups = PausedGroups::jobs(store.clone());

        let misfire = MisfirePolicy::new(clock.clone(), calendars.clone(), config.misfire_threshold);
        let persister = Persister::new(store.clone(), registry.clone(), ids.clone(), locks.clone());
        let recoverer = Recoverer::new(
            clock.clone(),
            locks.clone(),
            liveness.clone(),
            jobs.clone(),
            triggers.clone(),
            calendars.clone(),
            misfire.clone(),
            persister.clone(),
        );
        let acquirer = Acquirer::new(
            ids,
            jobs.clone(),
            triggers.clone(),
            locks.clone(),
            misfire.clone(),
            persister.clone(),
            recoverer.clone(),
        );
        let fire_cycle = FireCycle::new(store, clock.clone(), locks.clone(), persister.clone());
        let state_manager = StateManager::new(
            jobs.clone(),
            triggers.clone(),
            paused_trigger_groups.clone(),
            paused_job_groups.clone(),
            locks.clone(),
            misfire,
            persister.clone(),
        );

        Self {
            config,
            clock,
            liveness,
            locks,
            jobs,
            triggers,
            calendars,
            paused_trigger_groups,
            paused_job_groups,
            registry,
            persister,
            acquirer,
            fire_cycle,
            state_manager,
            recoverer,
            checkin_handler,
        }
    }
}
