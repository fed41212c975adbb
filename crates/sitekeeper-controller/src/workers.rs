//! Leader-only background workers: DH parameter rotation, certificate
//! expiry monitoring, and the job-queue consumer that turns queued
//! `Job`s into actual certificate regeneration. Spawned on leadership
//! acquisition, cancelled on loss — the same shape as the teacher's
//! `lease_expiry_worker` in `zvault-server::main`, generalized from one
//! fixed worker to several registered under a shared cancellation token.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng as _;
use serde::{Deserialize, Serialize};
use tokio_stream::StreamExt as _;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use sitekeeper_core::dhparams;
use sitekeeper_core::model::{CertificateType, Job, JobType};

use crate::state::ControllerState;

/// Minimum/maximum jittered interval between DH parameter freshness checks.
const DHPARAMS_CHECK_MIN_HOURS: u64 = 72;
const DHPARAMS_CHECK_MAX_HOURS: u64 = 144;

/// How often a running DH-params regeneration polls for a fresher set
/// stored elsewhere (e.g. by another process that briefly held leadership).
const DHPARAMS_FRESHNESS_POLL: Duration = Duration::from_secs(10);

const CERT_EXPIRY_CHECK_INTERVAL: Duration = Duration::from_secs(24 * 3600);

/// Backoff schedule for a job that keeps failing: 1s, 5s, 30s, then capped
/// at 5 minutes between further attempts.
const JOB_RETRY_BACKOFFS: [Duration; 4] =
    [Duration::from_secs(1), Duration::from_secs(5), Duration::from_secs(30), Duration::from_secs(300)];

fn job_retry_delay(attempt: u32) -> Duration {
    let idx = (attempt as usize).min(JOB_RETRY_BACKOFFS.len() - 1);
    JOB_RETRY_BACKOFFS[idx]
}

/// Notification thresholds for non-self-signed certificates, in days until
/// expiry (negative values mean already expired).
const EXPIRY_NOTIFY_THRESHOLDS_DAYS: [i64; 9] = [30, 14, 7, 3, 2, 1, 0, -1, -2];

/// Payload stored in `Job::data` for TLS-cert and ACME regeneration jobs.
#[derive(Debug, Serialize, Deserialize)]
struct CertJobData {
    /// The certificate being replaced, if this is a renewal rather than a
    /// first issuance.
    old_cert_id: Option<String>,
    domains: Vec<String>,
}

/// Spawns every leader-only worker, each exiting as soon as `cancel` fires.
pub fn spawn_leader_workers(state: Arc<ControllerState>, cancel: CancellationToken) {
    tokio::spawn(dhparams_worker(Arc::clone(&state), cancel.clone()));
    tokio::spawn(cert_expiry_worker(Arc::clone(&state), cancel.clone()));
    tokio::spawn(job_queue_worker(state, cancel));
}

async fn dhparams_worker(state: Arc<ControllerState>, cancel: CancellationToken) {
    info!("dhparams worker started");
    loop {
        let jitter_hours =
            rand::thread_rng().gen_range(DHPARAMS_CHECK_MIN_HOURS..=DHPARAMS_CHECK_MAX_HOURS);
        tokio::select! {
            () = tokio::time::sleep(Duration::from_secs(jitter_hours * 3600)) => {}
            () = cancel.cancelled() => {
                info!("dhparams worker stopping");
                return;
            }
        }

        let doc = match state.state_store.get_state().await {
            Ok(doc) => doc,
            Err(e) => {
                warn!(error = %e, "dhparams worker: failed to read state");
                continue;
            }
        };
        if !dhparams::needs_regeneration(doc.dh_params.as_ref(), state.config.dhparams.max_age_days)
        {
            continue;
        }

        info!(bits = state.config.dhparams.bits, "regenerating DH parameters");
        if let Err(e) = regenerate_dhparams(&state, &cancel).await {
            error!(error = %e, "dhparams regeneration failed");
        }
    }
}

async fn regenerate_dhparams(
    state: &Arc<ControllerState>,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let bits = state.config.dhparams.bits;
    let handle = tokio::task::spawn_blocking(move || dhparams::generate(bits));
    tokio::pin!(handle);

    let dh = loop {
        tokio::select! {
            result = &mut handle => break result??,
            () = tokio::time::sleep(DHPARAMS_FRESHNESS_POLL) => {
                if let Ok(doc) = state.state_store.get_state().await {
                    if let Some(existing) = &doc.dh_params {
                        if !dhparams::needs_regeneration(Some(existing), state.config.dhparams.max_age_days) {
                            info!("a fresher DH parameter set appeared elsewhere, aborting");
                            return Ok(());
                        }
                    }
                }
            }
            () = cancel.cancelled() => {
                info!("dhparams regeneration cancelled");
                return Ok(());
            }
        }
    };

    let mut doc = state.state_store.get_state().await?;
    doc.dh_params = Some(dh);
    state.state_store.write_state(&doc).await?;
    info!("DH parameters regenerated and stored");
    Ok(())
}

async fn cert_expiry_worker(state: Arc<ControllerState>, cancel: CancellationToken) {
    info!("certificate expiry monitor started");
    let mut notified: std::collections::HashSet<(String, i64)> = std::collections::HashSet::new();
    loop {
        tokio::select! {
            () = tokio::time::sleep(CERT_EXPIRY_CHECK_INTERVAL) => {}
            () = cancel.cancelled() => {
                info!("certificate expiry monitor stopping");
                return;
            }
        }

        let doc = match state.state_store.get_state().await {
            Ok(doc) => doc,
            Err(e) => {
                warn!(error = %e, "expiry monitor: failed to read state");
                continue;
            }
        };

        let now = chrono::Utc::now();
        for (cert_id, cert) in &doc.certificates {
            let Some(not_after) = cert.not_after else {
                continue;
            };
            let days_left = (not_after - now).num_days();

            if cert.cert_type == CertificateType::SelfSigned {
                if days_left < 7 {
                    let domains = cert.domains.clone().unwrap_or_default();
                    let data = CertJobData {
                        old_cert_id: Some(cert_id.clone()),
                        domains,
                    };
                    enqueue_job(&state, JobType::TlsCert, &data).await;
                }
                continue;
            }

            if EXPIRY_NOTIFY_THRESHOLDS_DAYS.contains(&days_left)
                && notified.insert((cert_id.clone(), days_left))
            {
                warn!(
                    cert_id,
                    days_left,
                    cert_type = ?cert.cert_type,
                    "certificate approaching or past expiry"
                );
            }
        }
    }
}

async fn enqueue_job(state: &Arc<ControllerState>, job_type: JobType, data: &CertJobData) {
    let Ok(data) = serde_json::to_string(data) else {
        return;
    };
    let job = Job {
        id: uuid::Uuid::new_v4().to_string(),
        job_type,
        data,
        created_at: chrono::Utc::now(),
    };
    if let Err(e) = state.state_store.enqueue_job(job).await {
        warn!(error = %e, "failed to enqueue certificate job");
    }
}

async fn job_queue_worker(state: Arc<ControllerState>, cancel: CancellationToken) {
    info!("job queue worker started");
    let Ok(mut jobs) = state.state_store.watch_jobs().await else {
        error!("job queue worker: failed to subscribe to job stream");
        return;
    };

    match state.state_store.list_jobs().await {
        Ok(backlog) => {
            for job in backlog {
                process_job(&state, job, &cancel);
            }
        }
        Err(e) => warn!(error = %e, "failed to list backlog jobs"),
    }

    loop {
        tokio::select! {
            job = jobs.next() => {
                match job {
                    Some(job) => process_job(&state, job, &cancel),
                    None => {
                        info!("job stream ended");
                        return;
                    }
                }
            }
            () = cancel.cancelled() => {
                info!("job queue worker stopping");
                return;
            }
        }
    }
}

/// Spawns a retry loop for `job` that keeps this worker's own select loop
/// free to keep pulling new jobs off the stream while a slow failure backs
/// off. A job is only deleted from the store on success; if `cancel` fires
/// mid-backoff (leadership lost) the job is left in place for the next
/// leader's backlog listing to pick up.
fn process_job(state: &Arc<ControllerState>, job: Job, cancel: &CancellationToken) {
    let state = Arc::clone(state);
    let cancel = cancel.clone();
    tokio::spawn(async move {
        let mut attempt: u32 = 0;
        loop {
            let result = run_job(&state, &job, &cancel).await;
            match result {
                Ok(()) => {
                    if let Err(e) = state.state_store.delete_job(&job.id).await {
                        warn!(job_id = %job.id, error = %e, "failed to delete completed job");
                    }
                    return;
                }
                Err(e) => {
                    let delay = job_retry_delay(attempt);
                    error!(
                        job_id = %job.id,
                        job_type = ?job.job_type,
                        error = %e,
                        attempt,
                        delay_secs = delay.as_secs(),
                        "job failed, retrying with backoff"
                    );
                    attempt += 1;
                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        () = cancel.cancelled() => {
                            info!(job_id = %job.id, "job retry loop cancelled, leaving job queued");
                            return;
                        }
                    }
                }
            }
        }
    });
}

async fn run_job(state: &Arc<ControllerState>, job: &Job, cancel: &CancellationToken) -> Result<(), String> {
    match job.job_type {
        JobType::TlsCert => process_self_signed_job(state, job).await,
        JobType::Acme => process_acme_job(state, job).await,
        JobType::DhparamsRegen => regenerate_dhparams(state, cancel).await.map_err(|e| e.to_string()),
    }
}

async fn process_self_signed_job(state: &Arc<ControllerState>, job: &Job) -> Result<(), String> {
    let data: CertJobData = serde_json::from_str(&job.data).map_err(|e| e.to_string())?;
    let (key_pem, cert_pem) =
        sitekeeper_core::CertificatesService::generate_self_signed(&data.domains)
            .map_err(|e| e.to_string())?;
    let new_id = format!("selfsigned-{}", uuid::Uuid::new_v4());
    state
        .certificates
        .set_certificate(CertificateType::SelfSigned, new_id.clone(), &key_pem, &cert_pem)
        .await
        .map_err(|e| e.to_string())?;
    if let Some(old_id) = &data.old_cert_id {
        state
            .certificates
            .replace_certificate(old_id, &new_id)
            .await
            .map_err(|e| e.to_string())?;
    }
    Ok(())
}

async fn process_acme_job(state: &Arc<ControllerState>, job: &Job) -> Result<(), String> {
    let data: CertJobData = serde_json::from_str(&job.data).map_err(|e| e.to_string())?;
    let Some(acme) = &state.acme else {
        return Err("ACME worker not configured (no acme.email set)".to_owned());
    };
    let new_id = acme.issue(&data.domains).await.map_err(|e| e.to_string())?;
    if let Some(old_id) = &data.old_cert_id {
        state
            .certificates
            .replace_certificate(old_id, &new_id)
            .await
            .map_err(|e| e.to_string())?;
    }
    Ok(())
}

// The health broadcaster itself runs agent-side (it probes the agent's own
// local sites over `https://localhost`); the controller's part is limited
// to `grpc::ping_node` and the collection window the `clusterstatus` admin
// route waits on, both on-demand rather than a standing worker.
