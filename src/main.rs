use actix_web::{web, App, HttpServer};
use conversation_service::{
    audit::{AuditTrail, MemoryAuditSink},
    collaborators::{AllowAllIdentity, MemoryNotificationSink, NotificationSink, RedisNotificationSink},
    config::Config,
    error::AppError,
    logging,
    presence::PresenceRegistry,
    routes,
    services::conversation_service::{ConversationPolicy, ConversationService},
    services::key_manager::KeyManager,
    services::notification_dispatcher::NotificationDispatcher,
    services::rate_limiter::{CounterStore, MemoryCounterStore, RateLimiter, RedisCounterStore},
    services::retention::{MemorySweepLock, RedisSweepLock, RetentionSweeper, SweepLock},
    state::AppState,
    store::{memory::MemoryStore, postgres::PostgresStore, ConversationStore, MessageStore},
    websocket,
};
use crypto_core::KdfParams;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

#[actix_web::main]
async fn main() -> Result<(), AppError> {
    logging::init_tracing();
    let cfg = Arc::new(Config::from_env()?);

    let (conversations, messages): (Arc<dyn ConversationStore>, Arc<dyn MessageStore>) =
        match &cfg.database_url {
            Some(url) => {
                let store = Arc::new(PostgresStore::connect(url).await?);
                tracing::info!("using postgres stores");
                (store.clone(), store)
            }
            None => {
                let store = MemoryStore::new();
                tracing::warn!("DATABASE_URL unset, using in-memory stores");
                (store.clone(), store)
            }
        };

    let redis = match &cfg.redis_url {
        Some(url) => Some(
            redis_utils::RedisPool::connect(url)
                .await
                .map_err(|e| AppError::StartServer(format!("redis: {e}")))?,
        ),
        None => {
            tracing::warn!("REDIS_URL unset, using in-process counters and queues");
            None
        }
    };

    let counter_store: Arc<dyn CounterStore> = match &redis {
        Some(pool) => Arc::new(RedisCounterStore::new(pool.manager())),
        None => MemoryCounterStore::new(),
    };
    let sink: Arc<dyn NotificationSink> = match &redis {
        Some(pool) => Arc::new(RedisNotificationSink::new(
            pool.manager(),
            cfg.notifications.digest_interval_secs * 2,
        )),
        None => MemoryNotificationSink::new(),
    };
    let sweep_lock: Arc<dyn SweepLock> = match &redis {
        Some(pool) => Arc::new(RedisSweepLock::new(pool.manager())),
        None => MemorySweepLock::new(),
    };

    let keys = Arc::new(KeyManager::new(
        cfg.server_secret.clone(),
        KdfParams {
            memory_kib: cfg.kdf_memory_kib,
            iterations: cfg.kdf_iterations,
            parallelism: 1,
        },
    ));
    // re-derive keys for every surviving conversation
    let surviving: Vec<Uuid> = conversations
        .list_all()
        .await?
        .into_iter()
        .map(|c| c.id)
        .collect();
    keys.hydrate(&surviving).await?;
    tracing::info!(count = surviving.len(), "conversation keys hydrated");

    let presence = PresenceRegistry::new(Duration::from_secs(cfg.presence.session_ttl_secs));
    let limiter = Arc::new(RateLimiter::new(counter_store, cfg.rate_limit.clone()));
    let audit_sink = MemoryAuditSink::new();
    let audit = AuditTrail::spawn(audit_sink.clone());
    let dispatcher = NotificationDispatcher::new(
        Duration::from_secs(cfg.notifications.offline_delay_secs),
        presence.clone(),
        sink,
    );

    let service = Arc::new(ConversationService::new(
        conversations.clone(),
        messages.clone(),
        keys.clone(),
        limiter,
        presence.clone(),
        dispatcher.clone(),
        Arc::new(AllowAllIdentity),
        audit,
        ConversationPolicy {
            max_participants: cfg.max_participants,
            edit_window_minutes: cfg.edit_window_minutes,
            default_retention_days: cfg.retention.message_retention_days,
            max_retention_days: cfg.retention.max_retention_days,
            default_auto_close_days: cfg.retention.auto_close_days,
            max_auto_close_days: cfg.retention.max_auto_close_days,
        },
    ));

    // expired presence sessions count as disconnects
    let sweeper_service = service.clone();
    let _presence_sweeper = presence.spawn_sweeper(
        Duration::from_secs((cfg.presence.session_ttl_secs / 4).max(1)),
        move |users| {
            let service = sweeper_service.clone();
            tokio::spawn(async move {
                for user_id in users {
                    if let Err(e) = service.broadcast_presence(user_id, false).await {
                        tracing::error!(error = %e, %user_id, "presence broadcast failed");
                    }
                }
            });
        },
    );

    let _digest = dispatcher.spawn_digest(
        Duration::from_secs(cfg.notifications.digest_interval_secs),
        conversations.clone(),
        messages.clone(),
    );

    let retention = Arc::new(RetentionSweeper::new(
        conversations,
        messages,
        keys,
        audit_sink,
        sweep_lock,
        cfg.retention.clone(),
    ));
    let _retention = retention.spawn(Duration::from_secs(cfg.retention.sweep_interval_secs));

    let lock_janitor = service.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(300));
        loop {
            ticker.tick().await;
            lock_janitor.evict_idle_locks().await;
        }
    });

    let state = AppState {
        config: cfg.clone(),
        service,
        presence,
        dispatcher,
    };

    let bind_addr = format!("0.0.0.0:{}", cfg.port);
    tracing::info!(%bind_addr, "starting conversation-service");

    HttpServer::new(move || {
        let cors = actix_cors::Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .wrap(cors)
            .app_data(web::Data::new(state.clone()))
            .service(routes::conversations::create_conversation)
            .service(routes::conversations::list_conversations)
            .service(routes::conversations::get_conversation)
            .service(routes::conversations::add_participant)
            .service(routes::conversations::remove_participant)
            .service(routes::conversations::mute_participant)
            .service(routes::conversations::mute_conversation)
            .service(routes::conversations::close_conversation)
            .service(routes::conversations::archive_conversation)
            .service(routes::conversations::mark_read)
            .service(routes::conversations::typing)
            .service(routes::messages::send_message)
            .service(routes::messages::get_messages)
            .service(routes::messages::edit_message)
            .service(routes::messages::delete_message)
            .service(websocket::ws_handler)
            .route("/health", web::get().to(|| async { "OK" }))
    })
    .bind(&bind_addr)
    .map_err(|e| AppError::StartServer(format!("bind: {e}")))?
    .run()
    .await
    .map_err(|e| AppError::StartServer(format!("run: {e}")))
}
