//! Admin REST surface: the external-collaborator API listed for
//! completeness in the channel spec, built as a thin `axum` router in the
//! teacher's `zvault_server::routes::*` idiom (`Router<Arc<ControllerState>>`
//! per resource, merged in `router()`).

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use sitekeeper_core::model::{AppBinding, CertificateType, Job, JobType, Site};

use crate::error::AppError;
use crate::grpc::{ping_node, HEALTH_COLLECTION_WINDOW};
use crate::state::ControllerState;

pub fn router(state: Arc<ControllerState>) -> Router<Arc<ControllerState>> {
    Router::new()
        .route("/site", get(list_sites).post(create_site))
        .route(
            "/site/{domain}",
            get(get_site).delete(delete_site).patch(patch_site),
        )
        .route("/site/{domain}/app", post(bind_app).put(bind_app))
        .route("/state", get(get_full_state).post(put_full_state).put(put_full_state))
        .route("/app", get(list_apps).post(upload_app))
        .route("/app/{name}", post(upload_app_named).delete(delete_app))
        .route("/certificate", get(list_certificates).post(create_certificate))
        .route("/certificate/{id}", axum::routing::delete(delete_certificate))
        .route("/certificate/refresh", post(refresh_certificates))
        .route("/dhparams", get(get_dhparams).post(regenerate_dhparams_now))
        .route("/clusterstatus", get(cluster_status))
        .route("/info", get(info))
        .route_layer(middleware::from_fn_with_state(state, require_auth))
}

async fn require_auth(
    State(state): State<Arc<ControllerState>>,
    headers: HeaderMap,
    request: axum::extract::Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| AppError::Unauthorized("missing bearer token".to_owned()))?;
    state
        .authenticator
        .authenticate(token)
        .await
        .map_err(|e| AppError::Unauthorized(e.to_string()))?;
    Ok(next.run(request).await)
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

// ---- sites -----------------------------------------------------------

#[derive(Deserialize)]
struct CreateSiteRequest {
    domain: String,
    #[serde(default)]
    aliases: Vec<String>,
    #[serde(default)]
    client_caching: bool,
    #[serde(default)]
    temporary: bool,
}

async fn list_sites(State(state): State<Arc<ControllerState>>) -> Result<Json<Vec<Site>>, AppError> {
    let doc = state.state_store.get_state().await?;
    Ok(Json(doc.sites))
}

async fn create_site(
    State(state): State<Arc<ControllerState>>,
    Json(body): Json<CreateSiteRequest>,
) -> Result<(StatusCode, Json<Site>), AppError> {
    let mut doc = state.state_store.get_state().await?;
    let site = Site {
        domain: body.domain,
        aliases: body.aliases,
        client_caching: body.client_caching,
        temporary: body.temporary,
        imported_tls_id: None,
        generated_tls_id: None,
        app: None,
    };
    doc.sites.push(site.clone());
    let doc = state.state_store.set_state(doc).await?;
    let saved = doc
        .find_site(&site.domain)
        .cloned()
        .ok_or_else(|| AppError::Internal("site vanished after write".to_owned()))?;
    Ok((StatusCode::CREATED, Json(saved)))
}

async fn get_site(
    State(state): State<Arc<ControllerState>>,
    Path(domain): Path<String>,
) -> Result<Json<Site>, AppError> {
    let doc = state.state_store.get_state().await?;
    doc.find_site(&domain)
        .cloned()
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("site not found: {domain}")))
}

async fn delete_site(
    State(state): State<Arc<ControllerState>>,
    Path(domain): Path<String>,
) -> Result<StatusCode, AppError> {
    let mut doc = state.state_store.get_state().await?;
    let before = doc.sites.len();
    doc.sites.retain(|s| s.domain != domain);
    if doc.sites.len() == before {
        return Err(AppError::NotFound(format!("site not found: {domain}")));
    }
    state.state_store.set_state(doc).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize, Default)]
struct PatchSiteRequest {
    aliases: Option<Vec<String>>,
    client_caching: Option<bool>,
    temporary: Option<bool>,
}

async fn patch_site(
    State(state): State<Arc<ControllerState>>,
    Path(domain): Path<String>,
    Json(body): Json<PatchSiteRequest>,
) -> Result<Json<Site>, AppError> {
    let mut doc = state.state_store.get_state().await?;
    {
        let site = doc
            .find_site_mut(&domain)
            .ok_or_else(|| AppError::NotFound(format!("site not found: {domain}")))?;
        if let Some(aliases) = body.aliases {
            site.aliases = aliases;
        }
        if let Some(client_caching) = body.client_caching {
            site.client_caching = client_caching;
        }
        if let Some(temporary) = body.temporary {
            site.temporary = temporary;
        }
    }
    let doc = state.state_store.set_state(doc).await?;
    doc.find_site(&domain)
        .cloned()
        .map(Json)
        .ok_or_else(|| AppError::Internal("site vanished after write".to_owned()))
}

#[derive(Deserialize)]
struct BindAppRequest {
    app: String,
}

async fn bind_app(
    State(state): State<Arc<ControllerState>>,
    Path(domain): Path<String>,
    Json(body): Json<BindAppRequest>,
) -> Result<Json<Site>, AppError> {
    let mut doc = state.state_store.get_state().await?;
    {
        let site = doc
            .find_site_mut(&domain)
            .ok_or_else(|| AppError::NotFound(format!("site not found: {domain}")))?;
        site.app = Some(AppBinding { name: body.app });
    }
    let doc = state.state_store.set_state(doc).await?;
    doc.find_site(&domain)
        .cloned()
        .map(Json)
        .ok_or_else(|| AppError::Internal("site vanished after write".to_owned()))
}

// ---- whole-document state ---------------------------------------------

async fn get_full_state(
    State(state): State<Arc<ControllerState>>,
) -> Result<Json<sitekeeper_core::model::StateDocument>, AppError> {
    Ok(Json(state.state_store.get_state().await?))
}

async fn put_full_state(
    State(state): State<Arc<ControllerState>>,
    Json(doc): Json<sitekeeper_core::model::StateDocument>,
) -> Result<Json<sitekeeper_core::model::StateDocument>, AppError> {
    Ok(Json(state.state_store.set_state(doc).await?))
}

// ---- app bundles (object store) ---------------------------------------

async fn list_apps(
    State(state): State<Arc<ControllerState>>,
) -> Result<Json<Vec<String>>, AppError> {
    let files = state
        .object_store
        .list()
        .await
        .map_err(|e| AppError::Internal(e.to_string()))?;
    Ok(Json(files.into_iter().map(|f| f.name).collect()))
}

#[derive(Deserialize)]
struct UploadAppQuery {
    name: String,
    #[serde(default)]
    hash: Option<String>,
    #[serde(default)]
    signature: Option<String>,
    #[serde(default)]
    content_type: Option<String>,
}

async fn upload_app(
    State(state): State<Arc<ControllerState>>,
    axum::extract::Query(query): axum::extract::Query<UploadAppQuery>,
    body: axum::body::Bytes,
) -> Result<StatusCode, AppError> {
    store_bundle(&state, &query.name, &query, body).await
}

async fn upload_app_named(
    State(state): State<Arc<ControllerState>>,
    Path(name): Path<String>,
    axum::extract::Query(mut query): axum::extract::Query<UploadAppQuery>,
    body: axum::body::Bytes,
) -> Result<StatusCode, AppError> {
    query.name = name.clone();
    store_bundle(&state, &name, &query, body).await
}

async fn store_bundle(
    state: &Arc<ControllerState>,
    name: &str,
    query: &UploadAppQuery,
    body: axum::body::Bytes,
) -> Result<StatusCode, AppError> {
    let mut metadata = HashMap::new();
    if let Some(hash) = &query.hash {
        metadata.insert(sitekeeper_core::object_store::META_HASH.to_owned(), hash.clone());
    }
    if let Some(signature) = &query.signature {
        metadata.insert(
            sitekeeper_core::object_store::META_SIGNATURE.to_owned(),
            signature.clone(),
        );
    }
    if let Some(content_type) = &query.content_type {
        metadata.insert(
            sitekeeper_core::object_store::META_TYPE.to_owned(),
            content_type.clone(),
        );
    }
    let reader: std::pin::Pin<Box<dyn tokio::io::AsyncRead + Send>> =
        Box::pin(std::io::Cursor::new(body.to_vec()));
    state
        .object_store
        .set(name, reader, metadata)
        .await
        .map_err(|e| AppError::Conflict(e.to_string()))?;
    Ok(StatusCode::CREATED)
}

async fn delete_app(
    State(state): State<Arc<ControllerState>>,
    Path(name): Path<String>,
) -> Result<StatusCode, AppError> {
    state
        .object_store
        .delete(&name)
        .await
        .map_err(|e| AppError::NotFound(e.to_string()))?;
    Ok(StatusCode::NO_CONTENT)
}

// ---- certificates -------------------------------------------------------

#[derive(Serialize)]
struct CertificateSummary {
    id: String,
    #[serde(rename = "type")]
    cert_type: CertificateType,
    domains: Option<Vec<String>>,
    not_after: Option<chrono::DateTime<chrono::Utc>>,
}

async fn list_certificates(
    State(state): State<Arc<ControllerState>>,
) -> Result<Json<Vec<CertificateSummary>>, AppError> {
    let doc = state.state_store.get_state().await?;
    Ok(Json(
        doc.certificates
            .into_iter()
            .map(|(id, cert)| CertificateSummary {
                id,
                cert_type: cert.cert_type,
                domains: cert.domains,
                not_after: cert.not_after,
            })
            .collect(),
    ))
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
enum CreateCertificateRequest {
    Imported { id: String, key_pem: String, certificate_pem: String },
    SelfSigned { id: String, domains: Vec<String> },
    Acme { domains: Vec<String> },
}

async fn create_certificate(
    State(state): State<Arc<ControllerState>>,
    Json(body): Json<CreateCertificateRequest>,
) -> Result<StatusCode, AppError> {
    match body {
        CreateCertificateRequest::Imported { id, key_pem, certificate_pem } => {
            state
                .certificates
                .set_certificate(
                    CertificateType::Imported,
                    id,
                    key_pem.as_bytes(),
                    certificate_pem.as_bytes(),
                )
                .await?;
        }
        CreateCertificateRequest::SelfSigned { id, domains } => {
            let (key_pem, cert_pem) =
                sitekeeper_core::CertificatesService::generate_self_signed(&domains)?;
            state
                .certificates
                .set_certificate(CertificateType::SelfSigned, id, &key_pem, &cert_pem)
                .await?;
        }
        CreateCertificateRequest::Acme { domains } => {
            let Some(acme) = &state.acme else {
                return Err(AppError::BadRequest(
                    "ACME is not configured (no acme.email set)".to_owned(),
                ));
            };
            acme.issue(&domains).await?;
        }
    }
    Ok(StatusCode::CREATED)
}

async fn delete_certificate(
    State(state): State<Arc<ControllerState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    state.certificates.delete_certificate(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn refresh_certificates(
    State(state): State<Arc<ControllerState>>,
) -> Result<Json<serde_json::Value>, AppError> {
    let doc = state.state_store.get_state().await?;
    let now = chrono::Utc::now();
    let mut enqueued = 0u32;
    for (cert_id, cert) in &doc.certificates {
        if cert.cert_type != CertificateType::SelfSigned {
            continue;
        }
        let due = cert.not_after.is_none_or(|na| na - now < chrono::Duration::days(7));
        if !due {
            continue;
        }
        let data = serde_json::json!({
            "old_cert_id": cert_id,
            "domains": cert.domains.clone().unwrap_or_default(),
        });
        let job = Job {
            id: uuid::Uuid::new_v4().to_string(),
            job_type: JobType::TlsCert,
            data: data.to_string(),
            created_at: now,
        };
        if state.state_store.enqueue_job(job).await.is_ok() {
            enqueued += 1;
        }
    }
    Ok(Json(serde_json::json!({ "enqueued": enqueued })))
}

// ---- dhparams ------------------------------------------------------------

async fn get_dhparams(
    State(state): State<Arc<ControllerState>>,
) -> Result<Json<Option<sitekeeper_core::model::DhParams>>, AppError> {
    let doc = state.state_store.get_state().await?;
    Ok(Json(doc.dh_params))
}

async fn regenerate_dhparams_now(
    State(state): State<Arc<ControllerState>>,
) -> Result<StatusCode, AppError> {
    let job = Job {
        id: uuid::Uuid::new_v4().to_string(),
        job_type: JobType::DhparamsRegen,
        data: String::new(),
        created_at: chrono::Utc::now(),
    };
    state
        .state_store
        .enqueue_job(job)
        .await
        .map_err(AppError::from)?;
    Ok(StatusCode::ACCEPTED)
}

// ---- cluster status / info ----------------------------------------------

#[derive(Serialize)]
struct NodeStatus {
    node_id: String,
    node_name: String,
    reachable: bool,
    site_health: Vec<sitekeeper_proto::SiteHealth>,
}

async fn cluster_status(
    State(state): State<Arc<ControllerState>>,
) -> Result<Response, AppError> {
    let node_ids: Vec<(String, String)> = state
        .registrations
        .read()
        .await
        .values()
        .map(|r| (r.node_id.clone(), r.node_name.clone()))
        .collect();

    let mut rx = state.health_events.subscribe();
    let mut pinged = Vec::new();
    for (node_id, _) in &node_ids {
        pinged.push((node_id.clone(), ping_node(&state, node_id).await));
    }

    let mut replies: HashMap<String, sitekeeper_proto::HealthMessage> = HashMap::new();
    let deadline = tokio::time::Instant::now() + HEALTH_COLLECTION_WINDOW;
    while tokio::time::Instant::now() < deadline {
        match tokio::time::timeout_at(deadline, rx.recv()).await {
            Ok(Ok((node_id, msg))) => {
                replies.insert(node_id, msg);
            }
            _ => break,
        }
    }

    let mut any_unhealthy = false;
    let statuses: Vec<NodeStatus> = node_ids
        .into_iter()
        .zip(pinged)
        .map(|((node_id, node_name), (_, reachable))| {
            let site_health = replies
                .get(&node_id)
                .map(|m| m.site_health.clone())
                .unwrap_or_default();
            if !reachable || site_health.iter().any(|s| !s.healthy) {
                any_unhealthy = true;
            }
            NodeStatus {
                node_id,
                node_name,
                reachable,
                site_health,
            }
        })
        .collect();

    let status = if any_unhealthy {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    Ok((status, Json(statuses)).into_response())
}

#[derive(Serialize)]
struct InfoResponse {
    node_name: String,
    is_leader: bool,
    manifest_file: String,
}

async fn info(State(state): State<Arc<ControllerState>>) -> Json<InfoResponse> {
    Json(InfoResponse {
        node_name: state.config.node_name.clone(),
        is_leader: state.is_leader(),
        manifest_file: state.config.manifest_file.clone(),
    })
}
