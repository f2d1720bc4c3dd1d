use actix_web::http::header::ContentType;
use actix_web::{App, test, web};
use assert_json_diff::assert_json_eq;
use serde_json::json;
use sqlx::sqlite::SqlitePool;

use sqlcheck::database as db;
use sqlcheck::fixture::FixtureLoader;
use sqlcheck::routes::{configure, json_error_handler};
use sqlcheck::sandbox::SqliteBackend;
use sqlcheck::verifier::Verifier;

// Keeps the scratch directory and history database alive for one test
struct TestEnv {
    _dir: tempfile::TempDir,
    verifier: web::Data<Verifier<SqliteBackend>>,
    pool: SqlitePool,
}

async fn create_test_env() -> TestEnv {
    let dir = tempfile::tempdir().unwrap();
    let backend = SqliteBackend::new(dir.path().join("scratch")).unwrap();
    let verifier = Verifier::new(backend, FixtureLoader::new("data/problems"));
    let pool = db::init_db(dir.path().join("history.sqlite3")).await.unwrap();
    TestEnv {
        _dir: dir,
        verifier: web::Data::new(verifier),
        pool,
    }
}

macro_rules! test_app {
    ($env:expr) => {
        test::init_service(
            App::new()
                .app_data($env.verifier.clone())
                .app_data(web::Data::new($env.pool.clone()))
                .app_data(web::JsonConfig::default().error_handler(json_error_handler))
                .configure(configure::<SqliteBackend>),
        )
        .await
    };
}

#[actix_web::test]
async fn test_verify_correct_and_recorded() {
    let env = create_test_env().await;
    let app = test_app!(env);

    let req = test::TestRequest::post()
        .uri("/problems/1/verify")
        .set_json(json!({
            "query": "SELECT id FROM Employees WHERE salary >= 60000;",
            "user_id": 3
        }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);

    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_json_eq!(body, json!({ "is_correct": true, "diagnostic": "" }));

    let attempts = db::fetch_attempts(&env.pool, 1, Some(3)).await.unwrap();
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].status, "Completed");
}

#[actix_web::test]
async fn test_verify_wrong_answer() {
    let env = create_test_env().await;
    let app = test_app!(env);

    let req = test::TestRequest::post()
        .uri("/problems/1/verify")
        .set_json(json!({ "query": "SELECT id FROM Employees" }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);

    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_json_eq!(
        body,
        json!({
            "is_correct": false,
            "diagnostic": "output does not match expected result"
        })
    );

    let req = test::TestRequest::post()
        .uri("/problems/1/verify")
        .set_json(json!({ "query": "DROP TABLE Employees" }))
        .to_request();
    let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
    assert_json_eq!(
        body,
        json!({ "is_correct": false, "diagnostic": "forbidden operation" })
    );

    let attempts = db::fetch_attempts(&env.pool, 1, None).await.unwrap();
    assert_eq!(attempts.len(), 2);
    assert!(attempts.iter().all(|a| a.status == "Failed"));
    assert_eq!(db::acceptance_rate(&env.pool, 1).await.unwrap(), 0.0);
}

#[actix_web::test]
async fn test_verify_unknown_problem() {
    let env = create_test_env().await;
    let app = test_app!(env);

    let req = test::TestRequest::post()
        .uri("/problems/404/verify")
        .set_json(json!({ "query": "SELECT 1" }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 404);

    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(body["reason"], "ERR_NOT_FOUND");
    assert_eq!(body["code"], 3);
    assert!(body["message"].is_string());

    // Infrastructure failures are not attempts
    let attempts = db::fetch_attempts(&env.pool, 404, None).await.unwrap();
    assert!(attempts.is_empty());
}

#[actix_web::test]
async fn test_verify_malformed_body() {
    let env = create_test_env().await;
    let app = test_app!(env);

    let req = test::TestRequest::post()
        .uri("/problems/1/verify")
        .insert_header(ContentType::json())
        .set_payload("{ \"query\": ")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 400);

    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(body["reason"], "ERR_INVALID_ARGUMENT");
    assert_eq!(body["code"], 1);
}
