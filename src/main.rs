use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use axum::Router;
use clap::Parser;
use dotenvy::dotenv;
use quartermaster::app_state::AppState;
use quartermaster::automation::AutomationService;
use quartermaster::config::{self, Args, CONFIG};
use quartermaster::db::Db;
use quartermaster::importer::Importer;
use quartermaster::indexer::{seed_builtin_indexers, IndexerRegistry};
use quartermaster::library::ScanTracker;
use quartermaster::metadata::opensubtitles::OpenSubtitlesApi;
use quartermaster::metadata::tmdb::TmdbApi;
use quartermaster::metadata::tvdb::TvdbApi;
use quartermaster::search::FederatedSearch;
use quartermaster::server;
use quartermaster::torrent::TorrentClient;
use quartermaster::tracing::init_tracer;
use quartermaster::utils;
use quartermaster::workers::{spawn_workers, WorkerContext};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower_http::cors::{Any, CorsLayer};

/// How long the server may drain after the shutdown signal
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() {
    // env file must land before the config store snapshots the env
    let dotenv_path = dotenv().ok();
    Args::parse().apply_configuration();
    init_tracer();
    match dotenv_path {
        Some(path) => tracing::info!("Loaded env variables from: {}", path.display()),
        None => tracing::debug!("No env dotfile found"),
    }

    let database_url: config::DatabaseUrl = CONFIG.get_value();
    let Some(database_url) = database_url.0 else {
        tracing::error!("DATABASE_URL is required");
        std::process::exit(1);
    };
    let session_secret: config::SessionSecret = CONFIG.get_value();
    if session_secret.0.is_none() {
        tracing::error!("SESSION_SECRET is required");
        std::process::exit(1);
    }
    let qbittorrent_url: config::QbittorrentUrl = CONFIG.get_value();
    let Some(qbittorrent_url) = qbittorrent_url.0 else {
        tracing::error!("QBITTORRENT_URL is required");
        std::process::exit(1);
    };

    let db = match Db::connect(&database_url).await {
        Ok(db) => db,
        Err(e) => {
            tracing::error!("Failed to connect to the store: {e}");
            std::process::exit(1);
        }
    };
    let db: &'static Db = Box::leak(Box::new(db));

    if let Err(e) = seed_admin(db).await {
        tracing::error!("Failed to seed admin user: {e}");
    }
    if let Err(e) = seed_builtin_indexers(db).await {
        tracing::error!("Failed to seed indexer catalog: {e}");
    }

    let metadata: &'static quartermaster::metadata::MetadataStack =
        Box::leak(Box::new(quartermaster::metadata::MetadataStack::default()));
    let tmdb_key: config::TmdbApiKey = CONFIG.get_value();
    match tmdb_key.0 {
        Some(key) => {
            let tmdb: &'static TmdbApi = Box::leak(Box::new(TmdbApi::new(key)));
            metadata.add_movie_provider(tmdb);
            metadata.add_show_provider(tmdb);
        }
        None => tracing::warn!("TMDB_API_KEY missing, tmdb lookups disabled"),
    }
    let tvdb_key: config::TvdbApiKey = CONFIG.get_value();
    match tvdb_key.0 {
        Some(key) => {
            let tvdb: &'static TvdbApi = Box::leak(Box::new(TvdbApi::new(&key)));
            metadata.add_show_provider(tvdb);
        }
        None => tracing::warn!("TVDB_API_KEY missing, tvdb lookups disabled"),
    }

    let subtitles: Option<&'static OpenSubtitlesApi> = {
        let key: config::OpensubtitlesApiKey = CONFIG.get_value();
        let user: config::OpensubtitlesUser = CONFIG.get_value();
        let pass: config::OpensubtitlesPass = CONFIG.get_value();
        match (key.0, user.0, pass.0) {
            (Some(key), Some(user), Some(pass)) => {
                Some(Box::leak(Box::new(OpenSubtitlesApi::new(&key, user, pass))))
            }
            _ => {
                tracing::warn!("OpenSubtitles credentials missing, subtitle fetching disabled");
                None
            }
        }
    };

    let qbittorrent_user: config::QbittorrentUser = CONFIG.get_value();
    let qbittorrent_pass: config::QbittorrentPass = CONFIG.get_value();
    let torrent_client =
        match TorrentClient::new(&qbittorrent_url, qbittorrent_user.0, qbittorrent_pass.0) {
            Ok(client) => client,
            Err(e) => {
                tracing::error!("Invalid torrent daemon configuration: {e}");
                std::process::exit(1);
            }
        };
    let torrent_client: &'static TorrentClient = Box::leak(Box::new(torrent_client));
    // a dead daemon at startup is fine, the next poll recovers the session
    if let Err(e) = torrent_client.login().await {
        tracing::warn!("Torrent daemon unreachable at startup: {e}");
    }

    let registry: &'static IndexerRegistry = Box::leak(Box::new(IndexerRegistry::new(db)));
    let search: &'static FederatedSearch = Box::leak(Box::new(FederatedSearch::new(registry)));
    let importer: &'static Importer = Box::leak(Box::new(Importer::new(db)));
    let scan_tracker: &'static ScanTracker = Box::leak(Box::new(ScanTracker::new()));
    let automation: &'static AutomationService = Box::leak(Box::new(AutomationService::new(
        db,
        search,
        torrent_client,
        importer,
    )));

    let cancellation_token = CancellationToken::new();
    let tracker = TaskTracker::new();

    tracker.spawn(automation.run(cancellation_token.clone()));
    spawn_workers(
        WorkerContext {
            db,
            metadata,
            torrent_client,
            importer,
            scan_tracker,
            registry,
            subtitles,
        },
        &tracker,
        cancellation_token.clone(),
    );

    let app_state = AppState {
        db,
        torrent_client,
        registry,
        search,
        metadata,
        scan_tracker,
        importer,
        automation,
        cancellation_token: cancellation_token.clone(),
    };

    let cors = CorsLayer::new()
        .allow_methods(Any)
        .allow_origin(Any)
        .allow_headers(Any);

    let app = Router::new()
        .nest("/api", server::api_router())
        .layer(cors)
        .with_state(app_state);

    let port: config::Port = CONFIG.get_value();
    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)), port.0);
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("Failed to bind port {}: {e}", port.0);
            std::process::exit(1);
        }
    };
    tracing::info!("Starting server on port {}", port.0);

    let server = {
        let cancellation_token = cancellation_token.clone();
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(cancellation_token.cancelled_owned())
                .await
            {
                tracing::error!("Server error: {e}");
            }
        })
    };

    shutdown_signal(&cancellation_token).await;

    tracing::info!("Shutting down, draining for up to {SHUTDOWN_DEADLINE:?}");
    tracker.close();
    let drained = tokio::time::timeout(SHUTDOWN_DEADLINE, async {
        let _ = server.await;
        tracker.wait().await;
    })
    .await;
    match drained {
        Ok(()) => tracing::info!("Gracefully shut down"),
        Err(_) => tracing::warn!("Drain deadline hit, aborting remaining work"),
    }
}

/// Wait for SIGINT or SIGTERM, then cancel everything
async fn shutdown_signal(token: &CancellationToken) {
    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("signal handler installs")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate => {}
        _ = token.cancelled() => {}
    }
    token.cancel();
}

/// First startup convenience: create the admin account from the
/// environment. An empty password means no seeding.
async fn seed_admin(db: &Db) -> Result<(), sqlx::Error> {
    let username: config::AdminUsername = CONFIG.get_value();
    let password: config::AdminPassword = CONFIG.get_value();
    let email: config::AdminEmail = CONFIG.get_value();
    let (Some(username), Some(password)) = (username.0, password.0) else {
        return Ok(());
    };
    if password.is_empty() || db.admin_exists().await? {
        return Ok(());
    }
    if db.user_by_username(&username).await?.is_some() {
        tracing::warn!(user = username, "Admin seed skipped, username taken");
        return Ok(());
    }
    let id = db
        .insert_user(
            &username,
            email.0.as_deref(),
            &utils::sha256_hex(&password),
            true,
        )
        .await?;
    tracing::info!(user = username, id, "Seeded admin account");
    Ok(())
}
