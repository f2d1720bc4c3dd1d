use std::sync::Arc;

use actix_web::{App, HttpServer, dev::Server, middleware, web};
use sqlx::sqlite::SqlitePool;

use crate::config::ServerConfig;
use crate::routes::{configure, json_error_handler};
use crate::sandbox::SandboxBackend;
use crate::verifier::Verifier;

pub fn build_server<B: SandboxBackend>(
    server_config: ServerConfig,
    verifier: Arc<Verifier<B>>,
    db_pool: SqlitePool,
    workers: Option<usize>,
) -> std::io::Result<Server> {
    let verifier = web::Data::from(verifier);
    let db_pool = web::Data::new(db_pool);

    let mut server = HttpServer::new(move || {
        App::new()
            .app_data(verifier.clone())
            .app_data(db_pool.clone())
            .app_data(web::JsonConfig::default().error_handler(json_error_handler))
            .wrap(middleware::Logger::default())
            .configure(configure::<B>)
    });
    if let Some(workers) = workers {
        server = server.workers(workers);
    }

    let server = server
        .bind((
            server_config
                .bind_address
                .unwrap_or("127.0.0.1".to_string()),
            server_config.bind_port.unwrap_or(12345),
        ))?
        .run();

    Ok(server)
}
