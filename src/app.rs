//! Component wiring per run mode.
//!
//! `proxy` runs the data plane, `controller` the plan consumers, and
//! `standalone` both in one process sharing caches and, with the memory
//! transport, one in-process broker.

use std::collections::HashMap;
use std::error::Error;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use sqlx::AnyPool;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tollgate_auth::{
    Argon2Hasher, AuthService, AuthVerdicts, Authorizer, CachedUserStore, MemoryUserStore,
    PasswordHasher, RestrictionService, SqlUserStore, User, UserStore,
};
use tollgate_bus::{BoundedContext, MemoryBroker, MessageBus, OffsetReset, SqlBus, SqlBusConfig};
use tollgate_cache::{Cache, DatabaseType, Evict, MemoryCache, SqlCache};
use tollgate_config::{BusTransport, CacheBackend, Config, UserEntry};
use tollgate_controller::{
    Controller, MemoryPlanStore, PasswordChangeInvalidator, PlanCaches, PlanStore, SqlPlanStore,
    UserPlan, UserTraffic, invalidation_processor,
};
use tollgate_egress::{DialerPool, IpResolver, StaticResolver, SysinfoResolver};
use tollgate_server::{ProxyComponents, ProxyServer, RateLimiter, dial_options};
use tracing::{debug, info, warn};

pub type BoxError = Box<dyn Error + Send + Sync>;

/// Lifetime given to plans of statically configured users.
const STATIC_PLAN_LIFETIME: Duration = Duration::from_secs(10 * 365 * 24 * 3600);
const CACHE_PURGE_INTERVAL: Duration = Duration::from_secs(60);

/// Opens buses for bounded contexts.
enum BusFactory {
    Memory(MemoryBroker),
    Sql {
        pools: HashMap<String, (AnyPool, DatabaseType)>,
        default_group: String,
    },
}

/// Shared backends opened once per process.
struct Backends {
    config: Config,
    database: Option<(AnyPool, DatabaseType)>,
    buses: BusFactory,
    restrictions: Arc<dyn Cache<bool>>,
    cache_pool: Option<(AnyPool, DatabaseType)>,
}

impl Backends {
    async fn open(config: Config) -> Result<Self, BoxError> {
        let db = &config.database;
        let acquire_timeout = Duration::from_secs(db.acquire_timeout_secs);

        let database = match &db.url {
            Some(url) => {
                let opened =
                    tollgate_cache::db::connect(url, db.max_connections, acquire_timeout).await?;
                info!(db_type = ?opened.1, "database connected");
                Some(opened)
            }
            None => None,
        };

        let cache_pool = match config.cache.backend {
            CacheBackend::Memory => None,
            CacheBackend::Sql => {
                let opened = match (&config.cache.url, &database) {
                    (Some(url), _) => {
                        tollgate_cache::db::connect(url, db.max_connections, acquire_timeout)
                            .await?
                    }
                    (None, Some(shared)) => shared.clone(),
                    (None, None) => {
                        return Err("cache.backend = sql needs cache.url or database.url".into());
                    }
                };
                Some(opened)
            }
        };

        let restrictions: Arc<dyn Cache<bool>> = match &cache_pool {
            Some((pool, db_type)) => {
                let cache = SqlCache::<bool>::new(pool.clone(), *db_type, "restrictions");
                cache.ensure_schema().await?;
                Arc::new(cache)
            }
            None => Arc::new(MemoryCache::<bool>::new(None)),
        };

        let buses = match config.bus.transport {
            BusTransport::Memory => BusFactory::Memory(MemoryBroker::new()),
            BusTransport::Sql => BusFactory::Sql {
                pools: HashMap::new(),
                default_group: format!("tollgate-{}", config.mode),
            },
        };

        Ok(Self {
            config,
            database,
            buses,
            restrictions,
            cache_pool,
        })
    }

    /// A new consumer/producer on `context`, plus its topic name.
    async fn bus(
        &mut self,
        context: BoundedContext,
    ) -> Result<(Arc<dyn MessageBus>, String), BoxError> {
        let settings = self
            .config
            .bus
            .context(context.as_str())
            .cloned()
            .unwrap_or_default();
        let topic = settings
            .topic
            .clone()
            .unwrap_or_else(|| context.as_str().to_string());

        let bus: Arc<dyn MessageBus> = match &mut self.buses {
            BusFactory::Memory(broker) => Arc::new(broker.bus()),
            BusFactory::Sql {
                pools,
                default_group,
            } => {
                let url = settings
                    .bootstrap_servers
                    .clone()
                    .or_else(|| self.config.database.url.clone())
                    .ok_or_else(|| format!("no bus address for {context}"))?;
                let (pool, db_type) = match pools.get(&url) {
                    Some(opened) => opened.clone(),
                    None => {
                        let db = &self.config.database;
                        let opened = tollgate_cache::db::connect(
                            &url,
                            db.max_connections,
                            Duration::from_secs(db.acquire_timeout_secs),
                        )
                        .await?;
                        pools.insert(url, opened.clone());
                        opened
                    }
                };
                let offset_reset: OffsetReset = settings.auto_offset_reset.parse()?;
                let group = settings
                    .group_id
                    .clone()
                    .unwrap_or_else(|| default_group.clone());
                let bus = SqlBus::new(
                    pool,
                    db_type,
                    SqlBusConfig::new(group)
                        .offset_reset(offset_reset)
                        .poll_interval(Duration::from_millis(self.config.bus.poll_interval_ms)),
                );
                bus.ensure_schema().await?;
                Arc::new(bus)
            }
        };
        Ok((bus, topic))
    }

    fn sql_cache<V>(&self, namespace: &str) -> Option<SqlCache<V>> {
        self.cache_pool
            .as_ref()
            .map(|(pool, db_type)| SqlCache::new(pool.clone(), *db_type, namespace))
    }

    async fn plan_caches(&self) -> Result<PlanCaches, BoxError> {
        let (Some(traffic), Some(plans), Some(markers)) = (
            self.sql_cache::<UserTraffic>("traffic"),
            self.sql_cache::<UserPlan>("plans"),
            self.sql_cache::<bool>("markers"),
        ) else {
            return Ok(PlanCaches::memory());
        };
        traffic.ensure_schema().await?;
        Ok(PlanCaches {
            traffic: Arc::new(traffic),
            plans: Arc::new(plans),
            markers: Arc::new(markers),
        })
    }

    /// Periodically delete expired rows of the remote cache.
    fn start_purging(&self, shutdown: CancellationToken) -> Option<JoinHandle<()>> {
        let cache = self.sql_cache::<()>("purge")?;
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(CACHE_PURGE_INTERVAL);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => match cache.purge_expired().await {
                        Ok(0) => {}
                        Ok(rows) => debug!(rows, "expired cache rows purged"),
                        Err(e) => warn!(error = %e, "cache purge failed"),
                    },
                }
            }
        }))
    }

    fn users(&self, hasher: &dyn PasswordHasher) -> Result<Arc<dyn UserStore>, BoxError> {
        if let Some((pool, db_type)) = &self.database {
            return Ok(Arc::new(SqlUserStore::new(pool.clone(), *db_type)));
        }
        let users = self
            .config
            .auth
            .users
            .iter()
            .map(|entry| static_user(entry, hasher))
            .collect::<Result<Vec<_>, _>>()?;
        info!(count = users.len(), "using statically configured users");
        Ok(Arc::new(MemoryUserStore::from_users(users)))
    }

    async fn plans(&self) -> Result<Arc<dyn PlanStore>, BoxError> {
        if let Some((pool, db_type)) = &self.database {
            let store = SqlPlanStore::new(pool.clone(), *db_type);
            store.ensure_schema().await?;
            return Ok(Arc::new(store));
        }
        let store = MemoryPlanStore::new();
        let valid_until = OffsetDateTime::now_utc() + STATIC_PLAN_LIFETIME;
        for entry in &self.config.auth.users {
            if entry.plan_limit_bytes > 0 {
                store.set_assignment(
                    entry.id,
                    UserPlan {
                        plan_id: entry.id,
                        bandwidth_limit_bytes: entry.plan_limit_bytes,
                        valid_until,
                    },
                );
            }
        }
        Ok(Arc::new(store))
    }
}

fn static_user(entry: &UserEntry, hasher: &dyn PasswordHasher) -> Result<User, BoxError> {
    let hash = match (&entry.password_hash, &entry.password) {
        (Some(hash), _) => hash.clone(),
        (None, Some(password)) => hasher.hash(password)?,
        (None, None) => return Err(format!("user {} has no password", entry.username).into()),
    };
    Ok(User::new(entry.id, &entry.username, &entry.email, hash))
}

/// Start the proxy data plane. Returns the listener task.
async fn start_proxy(
    backends: &mut Backends,
    users: Arc<dyn UserStore>,
    hasher: Arc<dyn PasswordHasher>,
    shutdown: &CancellationToken,
    tasks: &mut Vec<JoinHandle<()>>,
) -> Result<JoinHandle<Result<(), tollgate_server::ServerError>>, BoxError> {
    let config = backends.config.clone();

    let user_cache = Arc::new(MemoryCache::<User>::new(Some(Duration::from_secs(
        config.auth.user_cache_ttl_secs,
    ))));
    let verdicts = Arc::new(MemoryCache::<AuthVerdicts>::new(None));
    let authorizer = Authorizer::new(
        Arc::new(CachedUserStore::new(users, user_cache.clone())),
        AuthService::new(
            hasher,
            verdicts.clone(),
            Duration::from_millis(config.auth.validate_ttl_ms),
        ),
        RestrictionService::new(backends.restrictions.clone()),
    );

    let (users_bus, users_topic) = backends.bus(BoundedContext::Users).await?;
    let invalidator = PasswordChangeInvalidator::new(vec![
        verdicts as Arc<dyn Evict>,
        user_cache as Arc<dyn Evict>,
    ]);
    tasks.push(
        invalidation_processor("credential-invalidator", users_bus, &users_topic, invalidator)
            .start(shutdown.clone())
            .await?,
    );

    let dialers = Arc::new(DialerPool::new(
        Duration::from_secs(config.egress.rotation_ttl_secs),
        dial_options(&config.proxy),
    ));
    if config.egress.enabled {
        let resolver: Arc<dyn IpResolver> = if config.egress.static_ips.is_empty() {
            Arc::new(SysinfoResolver)
        } else {
            let ips = config
                .egress
                .static_ips
                .iter()
                .map(|ip| ip.parse::<IpAddr>())
                .collect::<Result<Vec<_>, _>>()?;
            Arc::new(StaticResolver::new(ips))
        };
        tasks.push(dialers.start_resolving(
            resolver,
            shutdown.clone(),
            Duration::from_secs(config.egress.resolve_interval_secs),
        ));
    } else {
        info!("egress binding disabled, using the system source address");
    }

    let rate_limiter = config
        .rate_limit
        .enabled
        .then(|| Arc::new(RateLimiter::new(config.rate_limit.resolve())));

    let (traffic_bus, traffic_topic) = backends.bus(BoundedContext::Proxy).await?;
    let server = ProxyServer::bind(
        &config,
        ProxyComponents {
            auth: Arc::new(authorizer),
            dialers,
            bus: traffic_bus,
            traffic_topic,
            rate_limiter,
        },
    )?;
    Ok(tokio::spawn(server.run(shutdown.clone())))
}

/// Start the plan controller processors.
async fn start_controller(
    backends: &mut Backends,
    users: Arc<dyn UserStore>,
    shutdown: &CancellationToken,
    tasks: &mut Vec<JoinHandle<()>>,
) -> Result<(), BoxError> {
    let controller = Controller::new(
        users,
        backends.plans().await?,
        backends.plan_caches().await?,
        RestrictionService::new(backends.restrictions.clone()),
    );

    let (traffic_bus, traffic_topic) = backends.bus(BoundedContext::Proxy).await?;
    let (signals, signal_topic) = backends.bus(BoundedContext::Plan).await?;
    let (plan_bus, plan_topic) = backends.bus(BoundedContext::Plan).await?;
    let (billing_bus, billing_topic) = backends.bus(BoundedContext::Billing).await?;

    for processor in [
        controller.traffic_processor(traffic_bus, &traffic_topic, signals, &signal_topic),
        controller.restriction_processor(plan_bus, &plan_topic),
        controller.billing_processor(billing_bus, &billing_topic),
    ] {
        tasks.push(processor.start(shutdown.clone()).await?);
    }
    Ok(())
}

/// Run the components selected by `config.mode` until `shutdown` fires.
pub async fn run(config: Config, shutdown: CancellationToken) -> Result<(), BoxError> {
    let mode = config.mode;
    info!(%mode, version = tollgate_core::VERSION, "starting tollgate");

    let mut backends = Backends::open(config).await?;
    let hasher: Arc<dyn PasswordHasher> = Arc::new(Argon2Hasher::default());
    let users = backends.users(hasher.as_ref())?;
    let mut tasks: Vec<JoinHandle<()>> = backends
        .start_purging(shutdown.clone())
        .into_iter()
        .collect();

    let started = async {
        let proxy = if mode.runs_proxy() {
            Some(
                start_proxy(
                    &mut backends,
                    users.clone(),
                    hasher.clone(),
                    &shutdown,
                    &mut tasks,
                )
                .await?,
            )
        } else {
            None
        };
        if mode.runs_controller() {
            start_controller(&mut backends, users.clone(), &shutdown, &mut tasks).await?;
        }
        Ok::<_, BoxError>(proxy)
    }
    .await;

    let result = match started {
        Ok(Some(proxy)) => match proxy.await {
            Ok(result) => result.map_err(BoxError::from),
            Err(e) => Err(e.into()),
        },
        Ok(None) => {
            shutdown.cancelled().await;
            Ok(())
        }
        Err(e) => Err(e),
    };

    // A failed start or a dead listener stops everything else too.
    shutdown.cancel();
    for task in tasks {
        if let Err(e) = task.await {
            warn!(error = %e, "background task panicked");
        }
    }
    info!("tollgate stopped");
    result
}
