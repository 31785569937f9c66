//! Gateway server

use std::collections::BTreeSet;
use std::future::{Future, IntoFuture};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use chrono::{TimeDelta, Utc};
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::auth::AuthStage;
use super::pipeline::{ChaffStage, Pipeline, RateLimitStage, RequestStage};
use super::router::{AppState, Pipelines, create_router};
use crate::authorization::{Audience, AuthorizationResolver};
use crate::certificate::CertificateIssuer;
use crate::chaff::ChaffTracker;
use crate::config::{Config, resolve_secret};
use crate::exchange::CodeExchangeEngine;
use crate::keys::{JwtCodec, key_manager_for};
use crate::ratelimit::{self, RateLimitKeys, RateLimitStore};
use crate::store::{
    ApiApp, AppId, CachedRealmStore, MemoryStore, Realm, RealmId, Session, TokenStore, User,
    UserId, VerificationCodeStore,
};
use crate::{Error, Result};

/// Verification gateway server
pub struct Gateway {
    /// Configuration
    config: Config,
    /// Backing store for realms, codes and tokens
    store: Arc<MemoryStore>,
    /// Cache-backed view of realms and apps
    realms: Arc<CachedRealmStore>,
    /// Limiter buckets
    limiter: Arc<dyn RateLimitStore>,
    /// Router state
    state: Arc<AppState>,
}

impl Gateway {
    /// Build the gateway: validate configuration, load seed data and signing
    /// keys, and assemble the per-endpoint pipelines.
    ///
    /// # Errors
    ///
    /// Invalid configuration or unusable signing keys.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;

        let store = Arc::new(MemoryStore::new());
        let realms = Arc::new(CachedRealmStore::new(
            store.clone(),
            resolve_secret(&config.cache.hmac_key)?.as_bytes(),
            config.cache.ttl,
        ));
        let resolver = Arc::new(AuthorizationResolver::new(realms.clone(), &config.auth)?);
        seed(&store, &resolver, &config)?;

        let token_codec = JwtCodec::new(
            key_manager_for(&config.token_signing.keys)?,
            &config.token_signing.issuer,
            &config.token_signing.audience,
        );
        let certificate_codec = JwtCodec::new(
            key_manager_for(&config.certificate_signing.keys)?,
            &config.certificate_signing.issuer,
            &config.certificate_signing.audience,
        );

        let codes: Arc<dyn VerificationCodeStore> = store.clone();
        let tokens: Arc<dyn TokenStore> = store.clone();
        let exchange = Arc::new(CodeExchangeEngine::new(
            codes,
            Arc::clone(&tokens),
            token_codec.clone(),
            &config.token_signing,
            &config.verification,
        )?);
        let certificates = Arc::new(CertificateIssuer::new(
            tokens,
            token_codec,
            certificate_codec,
            &config.certificate_signing,
        )?);

        let limiter = ratelimit::store_for(&config.rate_limit);
        let rate_limit: Arc<dyn RequestStage> = Arc::new(RateLimitStage::new(
            Arc::clone(&limiter),
            Arc::new(RateLimitKeys::new(&config.rate_limit, &config.auth.api_key_header)?),
            config.rate_limit.allow_on_error,
        ));

        let pipeline = |audience: Audience, chaff: bool| {
            let mut stages = vec![Arc::clone(&rate_limit)];
            if chaff && config.chaff.enabled {
                stages.push(Arc::new(ChaffStage::new(Arc::new(ChaffTracker::new(
                    &config.chaff,
                )))));
            }
            stages.push(Arc::new(AuthStage::new(Arc::clone(&resolver), audience)));
            Pipeline::new(stages)
        };
        let pipelines = Pipelines {
            verify: pipeline(Audience::Device, true),
            certificate: pipeline(Audience::Device, true),
            check_status: pipeline(Audience::Admin, true),
            issue: pipeline(Audience::Admin, false),
            expire: pipeline(Audience::Admin, false),
        };

        let state = Arc::new(AppState {
            exchange,
            certificates,
            pipelines,
            request_timeout: config.server.request_timeout,
            max_body_size: config.server.max_body_size,
        });

        Ok(Self {
            config,
            store,
            realms,
            limiter,
            state,
        })
    }

    /// The HTTP router, without a listener.
    #[must_use]
    pub fn router(&self) -> Router {
        create_router(Arc::clone(&self.state))
    }

    /// The backing store.
    #[must_use]
    pub fn store(&self) -> Arc<MemoryStore> {
        Arc::clone(&self.store)
    }

    /// Run the gateway until SIGINT / SIGTERM.
    ///
    /// # Errors
    ///
    /// Bind failures and server errors.
    pub async fn run(self) -> Result<()> {
        let addr = SocketAddr::new(
            self.config
                .server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            self.config.server.port,
        );

        let (shutdown_tx, _) = broadcast::channel(1);
        self.spawn_maintenance(&shutdown_tx);

        let listener = TcpListener::bind(addr).await?;

        info!("============================================================");
        info!("VERIFICATION GATEWAY v{}", env!("CARGO_PKG_VERSION"));
        info!("============================================================");
        info!(host = %self.config.server.host, port = %self.config.server.port, "Listening");
        info!(
            realms = self.config.realms.len(),
            apps = self.config.realms.iter().map(|r| r.apps.len()).sum::<usize>(),
            sessions = self.config.sessions.len(),
            "Seed data loaded"
        );
        info!(
            backend = self.limiter.backend(),
            tokens = self.config.rate_limit.tokens,
            interval = ?self.config.rate_limit.interval,
            fail_open = self.config.rate_limit.allow_on_error,
            "Rate limiting"
        );
        if !self.config.rate_limit.enabled {
            warn!("RATE LIMITING disabled - every request is admitted");
        }
        info!("  POST http://{addr}/api/verify");
        info!("  POST http://{addr}/api/certificate");
        info!("  POST http://{addr}/api/checkcodestatus");
        info!("  POST http://{addr}/api/issue");
        info!("  POST http://{addr}/api/expirecode");
        info!("============================================================");

        let app = self
            .router()
            .into_make_service_with_connect_info::<SocketAddr>();
        let server = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal(shutdown_tx.clone()))
            .into_future();

        let mut drain_rx = shutdown_tx.subscribe();
        let drain_timeout = self.config.server.shutdown_timeout;
        let drain_deadline = async move {
            let _ = drain_rx.recv().await;
            tokio::time::sleep(drain_timeout).await;
        };

        tokio::select! {
            result = server => result.map_err(|e| Error::Internal(e.to_string()))?,
            () = drain_deadline => {
                warn!(timeout = ?drain_timeout, "Graceful shutdown timed out, dropping open connections");
            }
        }

        info!("Gateway stopped");
        Ok(())
    }

    /// Limiter pruning, cache eviction and dead-code purging.
    fn spawn_maintenance(&self, shutdown_tx: &broadcast::Sender<()>) {
        let limiter = Arc::clone(&self.limiter);
        spawn_periodic(
            "ratelimit_prune",
            self.config.rate_limit.prune_interval,
            shutdown_tx.subscribe(),
            move || {
                let limiter = Arc::clone(&limiter);
                async move {
                    limiter.prune();
                    debug!(keys = limiter.len(), "Pruned rate limiter");
                }
            },
        );

        let realms = Arc::clone(&self.realms);
        spawn_periodic(
            "cache_eviction",
            self.config.cache.eviction_interval,
            shutdown_tx.subscribe(),
            move || {
                let realms = Arc::clone(&realms);
                async move {
                    let evicted = realms.evict_expired();
                    let stats = realms.app_stats();
                    debug!(evicted, entries = stats.size, hit_rate = stats.hit_rate, "Evicted expired cache entries");
                }
            },
        );

        let store = Arc::clone(&self.store);
        let retention = TimeDelta::from_std(self.config.verification.retention)
            .unwrap_or(TimeDelta::days(1));
        spawn_periodic(
            "purge",
            self.config.verification.purge_interval,
            shutdown_tx.subscribe(),
            move || {
                let store = Arc::clone(&store);
                async move {
                    let cutoff = Utc::now() - retention;
                    match store.purge_expired(cutoff).await {
                        Ok(n) if n > 0 => info!(purged = n, "Purged expired verification codes"),
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "Failed to purge verification codes"),
                    }
                    match store.purge_tokens(cutoff).await {
                        Ok(n) if n > 0 => info!(purged = n, "Purged expired tokens"),
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "Failed to purge tokens"),
                    }
                }
            },
        );
    }
}

/// Populate the store from the seed sections of the configuration.
fn seed(store: &MemoryStore, resolver: &AuthorizationResolver, config: &Config) -> Result<()> {
    for realm in &config.realms {
        store.put_realm(Realm {
            id: RealmId(realm.id),
            name: realm.name.clone(),
            admins: realm.admins.iter().copied().map(UserId).collect::<BTreeSet<_>>(),
            settings: realm.settings.clone(),
        });
        for app in &realm.apps {
            store.put_app(ApiApp {
                id: AppId(app.id),
                name: app.name.clone(),
                realm_id: Some(RealmId(realm.id)),
                key_type: app.key_type,
                key_digest: resolver.api_key_digest(&resolve_secret(&app.api_key)?),
            });
        }
        debug!(realm_id = realm.id, apps = realm.apps.len(), "Seeded realm");
    }

    for user in &config.users {
        store.put_user(User {
            id: UserId(user.id),
            email: user.email.clone(),
            name: user.name.clone(),
            system_admin: user.system_admin,
        });
    }

    let now = Utc::now();
    for session in &config.sessions {
        let ttl = TimeDelta::from_std(session.ttl)
            .map_err(|e| Error::Config(format!("session '{}' ttl: {e}", session.id)))?;
        store.put_session(Session {
            id: resolve_secret(&session.id)?,
            user_id: UserId(session.user_id),
            realm_id: session.realm_id.map(RealmId),
            expires_at: now + ttl,
        });
    }
    Ok(())
}

/// Run `task` every `every` until shutdown.
fn spawn_periodic<F, Fut>(
    name: &'static str,
    every: Duration,
    mut shutdown: broadcast::Receiver<()>,
    mut task: F,
) where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        // the first tick completes immediately
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => task().await,
                _ = shutdown.recv() => {
                    debug!(task = name, "Maintenance task stopped");
                    break;
                }
            }
        }
    });
}

/// Shutdown signal handler
async fn shutdown_signal(shutdown_tx: broadcast::Sender<()>) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
    let _ = shutdown_tx.send(());
}
