use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use actix_web::dev::ServerHandle;
use actix_web::{App, HttpResponse, HttpServer, web};

use sqlcheck::fixture::{FixtureError, FixtureLoader, RemoteStore, SETUP_SCRIPT, SOLUTION_SCRIPT};

// Object store stand-in: problem 7 lives remotely, problem 8 is broken
async fn serve_object(path: web::Path<(String, String)>) -> HttpResponse {
    let (folder, artifact) = path.into_inner();
    match (folder.as_str(), artifact.as_str()) {
        ("007", "solution.sql") => HttpResponse::Ok().body("SELECT x FROM t ORDER BY x;"),
        ("007", "metadata.json") => HttpResponse::Ok().body(r#"{ "requires_order": true }"#),
        ("009", "problem.sql") => HttpResponse::Ok().body("-- remote copy"),
        ("008", _) => HttpResponse::InternalServerError().finish(),
        _ => HttpResponse::NotFound().finish(),
    }
}

fn start_store() -> std::io::Result<(SocketAddr, ServerHandle)> {
    let server = HttpServer::new(|| {
        App::new().route("/problems/{folder}/{artifact}", web::get().to(serve_object))
    })
    .workers(1)
    .bind(("127.0.0.1", 0))?;
    let addr = server.addrs()[0];
    let server = server.run();
    let handle = server.handle();
    actix_web::rt::spawn(server);
    Ok((addr, handle))
}

fn loader(root: &Path, addr: SocketAddr) -> FixtureLoader {
    let remote = RemoteStore::new(format!("http://{addr}/"), Duration::from_secs(5)).unwrap();
    FixtureLoader::new(root).with_remote(remote)
}

fn write_local(root: &Path, problem_id: u32, name: &str, content: &str) {
    let dir = root.join(format!("{problem_id:03}"));
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join(name), content).unwrap();
}

#[actix_web::test]
async fn test_remote_fallback() {
    let (addr, handle) = start_store().unwrap();
    let root = tempfile::tempdir().unwrap();
    write_local(root.path(), 7, SETUP_SCRIPT, "CREATE TABLE t (x INTEGER);");
    write_local(root.path(), 9, SETUP_SCRIPT, "-- local copy");

    let loader = loader(root.path(), addr);

    let fixture = loader.load_fixture(7).await.unwrap();
    assert_eq!(fixture.setup_script, "CREATE TABLE t (x INTEGER);");
    assert_eq!(fixture.solution_script, "SELECT x FROM t ORDER BY x;");
    assert!(fixture.requires_order);

    // The local catalog shadows the remote store
    assert_eq!(loader.load(9, SETUP_SCRIPT).await.unwrap(), "-- local copy");

    handle.stop(true).await;
}

#[actix_web::test]
async fn test_remote_failures() {
    let (addr, handle) = start_store().unwrap();
    let root = tempfile::tempdir().unwrap();
    let loader = loader(root.path(), addr);

    let err = loader.load(11, SOLUTION_SCRIPT).await.unwrap_err();
    assert!(matches!(err, FixtureError::NotFound { problem_id: 11, .. }), "{err}");

    let err = loader.load(8, SOLUTION_SCRIPT).await.unwrap_err();
    assert!(matches!(err, FixtureError::Unavailable { problem_id: 8, .. }), "{err}");

    handle.stop(true).await;
}
