use actix_web::{HttpResponse, web};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqlitePool;

use super::ErrorResponse;
use crate::database as db;
use crate::sandbox::SandboxBackend;
use crate::verifier::{Verifier, VerifyError};

#[derive(Serialize, Deserialize, Debug)]
pub struct VerifyRequest {
    pub query: String,
    #[serde(default)]
    pub user_id: Option<u32>,
}

/// Registers the verification endpoint for a verifier over backend `B`
pub fn configure<B: SandboxBackend>(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::resource("/problems/{problem_id}/verify").route(web::post().to(verify_handler::<B>)),
    );
}

pub async fn verify_handler<B: SandboxBackend>(
    verifier: web::Data<Verifier<B>>,
    pool: web::Data<SqlitePool>,
    path: web::Path<u32>,
    body: web::Json<VerifyRequest>,
) -> HttpResponse {
    let problem_id = path.into_inner();
    let VerifyRequest { query, user_id } = body.into_inner();

    match verifier.verify(problem_id, &query).await {
        Ok(verdict) => {
            if let Err(e) = db::record_attempt(&pool, problem_id, user_id, &verdict).await {
                log::error!("Failed to record attempt on problem {problem_id}: {e}");
            }
            HttpResponse::Ok().json(verdict)
        }
        Err(e) => {
            log::error!("Verification of problem {problem_id} failed: {e}");
            error_response(&e)
        }
    }
}

fn error_response(error: &VerifyError) -> HttpResponse {
    let message = error.to_string();
    match error {
        VerifyError::FixtureNotFound { .. } => HttpResponse::NotFound().json(ErrorResponse {
            reason: "ERR_NOT_FOUND",
            code: 3,
            message,
        }),
        VerifyError::Timeout { .. } => HttpResponse::GatewayTimeout().json(ErrorResponse {
            reason: "ERR_TIMEOUT",
            code: 7,
            message,
        }),
        VerifyError::FixtureUnavailable { .. } | VerifyError::SandboxUnavailable(_) => {
            HttpResponse::InternalServerError().json(ErrorResponse {
                reason: "ERR_EXTERNAL",
                code: 5,
                message,
            })
        }
        VerifyError::MalformedFixture { .. }
        | VerifyError::SetupFailed { .. }
        | VerifyError::SolutionFailed { .. }
        | VerifyError::InvalidFixture { .. } => {
            HttpResponse::InternalServerError().json(ErrorResponse {
                reason: "ERR_INTERNAL",
                code: 6,
                message,
            })
        }
    }
}
