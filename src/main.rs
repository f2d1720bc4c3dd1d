use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;

use sqlcheck::config::{CliArgs, Config, DatabaseConfig};
use sqlcheck::database as db;
use sqlcheck::fixture::FixtureLoader;
use sqlcheck::sandbox::{Janitor, MySqlBackend, SandboxBackend, SqliteBackend};
use sqlcheck::verifier::Verifier;
use sqlcheck::web_server::build_server;

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let cli = CliArgs::parse();
    if cli.workers == Some(0) {
        anyhow::bail!("The number of worker threads must not be 0");
    }

    let config = cli.to_config().context("Failed to load configuration")?;
    let fixtures =
        FixtureLoader::from_config(&config.fixtures).context("Failed to build fixture loader")?;

    match config.database.clone() {
        DatabaseConfig::Sqlite(sqlite) => {
            let scratch_dir = match sqlite.scratch_dir {
                Some(dir) => dir,
                None => SqliteBackend::default_scratch_dir()?,
            };
            let backend = SqliteBackend::new(&scratch_dir)
                .with_context(|| format!("Failed to prepare {}", scratch_dir.display()))?;
            log::info!("Sandboxes are SQLite files under {}", scratch_dir.display());
            run(&cli, config, backend, fixtures).await
        }
        DatabaseConfig::Mysql(mysql) => {
            let backend = MySqlBackend::connect(&mysql)
                .await
                .with_context(|| format!("Failed to connect to MySQL at {}:{}", mysql.host, mysql.port))?;
            log::info!("Sandboxes are schemas on MySQL at {}:{}", mysql.host, mysql.port);
            run(&cli, config, backend, fixtures).await
        }
    }
}

async fn run<B: SandboxBackend>(
    cli: &CliArgs,
    config: Config,
    backend: B,
    fixtures: FixtureLoader,
) -> anyhow::Result<()> {
    let Config {
        server: server_config,
        sandbox: sandbox_config,
        history: history_config,
        ..
    } = config;

    let verifier = Arc::new(Verifier::from_config(backend, fixtures, &sandbox_config));
    let janitor = Janitor::new(verifier.schema_manager().clone());

    if cli.sweep {
        let dropped = janitor
            .sweep_all()
            .await
            .context("Failed to sweep leftover sandboxes")?;
        log::info!("Dropped {dropped} leftover sandboxes");
    }

    if let Some(problem_id) = cli.preview {
        let rows = verifier.expected_output(problem_id).await?;
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    if let Some(problem_id) = cli.self_check {
        verifier.self_check(problem_id).await?;
        log::info!("Problem {problem_id} passed its self-check");
        return Ok(());
    }

    let db_path = match history_config.path {
        Some(path) => path,
        None => db::get_db_path()?,
    };
    if cli.flush_history {
        db::remove_db(&db_path);
    }
    let db_pool = db::init_db(&db_path)
        .await
        .context("Failed to initialize history database")?;
    let shutdown_token = CancellationToken::new();

    // ======= PREPARATION END, EXECUTION START =======

    let janitor_task = tokio::spawn(janitor.run(
        sandbox_config.janitor_interval.into(),
        shutdown_token.clone(),
    ));

    let server = build_server(server_config, verifier.clone(), db_pool, cli.workers)
        .context("Failed to build server")?;
    let server_handle = server.handle();
    let server_task = actix_web::rt::spawn(server);

    // ===== EXECUTION END, WAITING FOR SHUTDOWN ======

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            log::info!("Ctrl-c received, shutting down...");
        }
        res_server = server_task => {
            log::error!("Server terminated unexpectedly: {:?}", res_server);
        }
    }

    // 1. Stop accepting requests and let in-flight verifications finish
    server_handle.stop(true).await;

    // 2. Stop the periodic janitor
    shutdown_token.cancel();
    if let Err(e) = janitor_task.await {
        log::error!("Janitor task finished with error: {:?}", e);
    }

    // 3. Last attempt at whatever is still orphaned
    let failures = Janitor::new(verifier.schema_manager().clone())
        .sweep_registered()
        .await;
    for failure in &failures {
        log::error!("{failure}");
    }

    log::info!("Shutdown complete");
    Ok(())
}
