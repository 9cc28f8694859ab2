use chrono::{DateTime, Utc};
use futures::stream::StreamExt;

use crate::{
    apis::documentdb_types::{DocumentDB, DocumentDBPhase, ReplicationStatus},
    backups::{
        manager::{
            backup_error_policy, reconcile_backup, reconcile_scheduled_backup, run_backup_gc,
            scheduled_backup_error_policy,
        },
        types::{Backup, BackupPhase, ScheduledBackup},
    },
    cloudnativepg::{
        clusters::Cluster,
        cnpg::{get_cluster, reconcile_cnpg, resolve_bootstrap_backup, ClusterInputs},
    },
    config::Config,
    replication::{
        coordinator::reconcile_replication, read_token, replication_role, validate_replication,
    },
    secret::{connection_string, resolve_credential_secret},
    service::{
        delete_exposure_service, exposure_service_endpoint, reconcile_exposure_service,
    },
    telemetry, tls, Error, Metrics, Result,
};
use k8s_openapi::{
    api::core::v1::{Namespace, Service},
    apimachinery::pkg::apis::meta::v1::{Condition, Time},
};
use kube::{
    api::{Api, ListParams, Patch, PatchParams, ResourceExt},
    client::Client,
    runtime::{
        controller::{Action, Controller},
        events::{Event, EventType, Recorder, Reporter},
        finalizer::{finalizer, Event as Finalizer},
        watcher::Config as watcherConfig,
    },
    Resource,
};
use rand::Rng;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tokio::{sync::RwLock, time::Duration};
use tracing::*;

pub static DOCUMENTDB_FINALIZER: &str = "documentdbs.documentdb.io";
pub static DOCUMENTDB_ANNOTATION: &str = "documentdbs.documentdb.io/watch";

pub static SUPPORTED_API_VERSIONS: &[&str] = &["documentdb.io/v1alpha1", "documentdb.io/preview"];

// Context for our reconciler
#[derive(Clone)]
pub struct Context {
    /// Kubernetes client
    pub client: Client,
    /// Diagnostics read by the web server
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    /// Prometheus metrics
    pub metrics: Metrics,
}

#[instrument(skip(ctx, ddb), fields(trace_id))]
async fn reconcile(ddb: Arc<DocumentDB>, ctx: Arc<Context>) -> Result<Action> {
    let trace_id = telemetry::get_trace_id();
    Span::current().record("trace_id", &field::display(&trace_id));
    let cfg = Config::default();
    let _timer = ctx.metrics.count_and_measure();
    ctx.diagnostics.write().await.last_event = Utc::now();
    let ns = ddb.namespace().unwrap(); // ddb is namespace scoped
    let ddbs: Api<DocumentDB> = Api::namespaced(ctx.client.clone(), &ns);
    let annotations = ddb.meta().annotations.clone().unwrap_or_default();

    if let Some(value) = annotations.get(DOCUMENTDB_ANNOTATION) {
        if value == "false" {
            info!(
                "Skipping reconciliation for DocumentDB \"{}\" in {}",
                ddb.name_any(),
                ns
            );
            return Ok(Action::await_change());
        }
    }

    debug!("Reconciling DocumentDB \"{}\" in {}", ddb.name_any(), ns);
    finalizer(&ddbs, DOCUMENTDB_FINALIZER, ddb, |event| async {
        match event {
            Finalizer::Apply(ddb) => match ddb.reconcile(ctx.clone(), &cfg).await {
                Ok(action) => Ok(action),
                Err(requeue_action) => Ok(requeue_action),
            },
            Finalizer::Cleanup(ddb) => ddb.cleanup(ctx.clone()).await,
        }
    })
    .await
    .map_err(|e| Error::FinalizerError(Box::new(e)))
}

fn error_policy(ddb: Arc<DocumentDB>, error: &Error, ctx: Arc<Context>) -> Action {
    warn!("reconcile failed: {:?}", error);
    ctx.metrics.reconcile_failure(&ddb, error);
    Action::requeue(Duration::from_secs(5 * 60))
}

/// Everything the phase machine looks at for one pass.
#[derive(Debug, Default)]
pub struct PhaseInputs {
    pub deleting: bool,
    pub tls_ready: bool,
    pub cluster_exists: bool,
    pub cluster_ready: bool,
    pub endpoint_ready: bool,
    /// Consecutive passes that observed the Postgres cluster not Ready.
    pub consecutive_unready: i32,
    pub observed_primary: Option<String>,
    pub desired_primary: Option<String>,
    pub promotion_in_progress: bool,
    pub terminal_failure: bool,
}

/// One transition per pass; the lowest-numbered applicable transition wins.
pub fn next_phase(current: DocumentDBPhase, inputs: &PhaseInputs) -> DocumentDBPhase {
    use DocumentDBPhase::*;
    // 1. any -> Deleting on deletion timestamp
    if inputs.deleting {
        return Deleting;
    }
    // 2. Pending -> Provisioning once TLS is ready and the cluster exists
    if current == Pending && inputs.tls_ready && inputs.cluster_exists {
        return Provisioning;
    }
    // 3. Provisioning -> Ready on full health
    if current == Provisioning && inputs.cluster_ready && inputs.endpoint_ready {
        return Ready;
    }
    // 4. Ready -> Degraded after two consecutive unready observations
    if current == Ready && inputs.consecutive_unready >= 2 {
        return Degraded;
    }
    // 5. Ready|Degraded -> Promoting when the observed primary diverges
    if matches!(current, Ready | Degraded) {
        if let (Some(observed), Some(desired)) =
            (&inputs.observed_primary, &inputs.desired_primary)
        {
            if observed != desired {
                return Promoting;
            }
        }
    }
    // 6. Promoting -> Ready on convergence
    if current == Promoting
        && !inputs.promotion_in_progress
        && inputs.observed_primary == inputs.desired_primary
    {
        return Ready;
    }
    // 7. any non-terminal -> Failed on a non-retriable error
    if inputs.terminal_failure && !matches!(current, Deleting | Failed) {
        return Failed;
    }
    // A recovered cluster leaves Degraded; a corrected spec leaves Failed
    if current == Degraded && inputs.cluster_ready && inputs.consecutive_unready == 0 {
        return Ready;
    }
    if current == Failed && !inputs.terminal_failure {
        return Pending;
    }
    current
}

pub fn new_condition(
    type_: &str,
    status: &str,
    reason: &str,
    message: &str,
    observed_generation: Option<i64>,
) -> Condition {
    Condition {
        type_: type_.to_string(),
        status: status.to_string(),
        reason: reason.to_string(),
        message: message.to_string(),
        last_transition_time: Time(Utc::now()),
        observed_generation,
    }
}

/// Replace the condition of the same type, preserving its transition time
/// when the status did not actually change.
pub fn upsert_condition(existing: Option<&Vec<Condition>>, condition: Condition) -> Vec<Condition> {
    let mut out = existing.cloned().unwrap_or_default();
    match out.iter_mut().find(|c| c.type_ == condition.type_) {
        Some(found) => {
            let last_transition_time = if found.status == condition.status {
                found.last_transition_time.clone()
            } else {
                condition.last_transition_time.clone()
            };
            *found = Condition {
                last_transition_time,
                ..condition
            };
        }
        None => out.push(condition),
    }
    out
}

impl DocumentDB {
    // Reconcile (for non-finalizer related changes)
    #[instrument(skip(self, ctx, cfg))]
    async fn reconcile(&self, ctx: Arc<Context>, cfg: &Config) -> Result<Action, Action> {
        let client = ctx.client.clone();
        let ns = self.namespace().unwrap();
        let name = self.name_any();
        let ddbs: Api<DocumentDB> = Api::namespaced(client.clone(), &ns);
        let current_phase = self
            .status
            .as_ref()
            .map(|s| s.phase)
            .unwrap_or(DocumentDBPhase::Pending);

        // Replication topology is validated before any child is created
        let replication = self
            .spec
            .clusterReplication
            .clone()
            .filter(|r| r.fleetEnabled);
        if let Some(rep) = &replication {
            if let Err(e) = validate_replication(rep) {
                return self
                    .fail(ctx.clone(), "PrimaryNotInClusterList", &e.to_string())
                    .await;
            }
        }
        if let Some(version) = &self.spec.documentDBVersion {
            if semver::Version::parse(version).is_err() {
                return self
                    .fail(
                        ctx.clone(),
                        "InvalidVersion",
                        &format!("documentDBVersion {} is not a semantic version", version),
                    )
                    .await;
            }
        }

        let role = replication_role(replication.as_ref(), &cfg.cluster_name);
        let materialize = replication.is_none() || role.is_some();

        // A hub that is not itself a member only coordinates
        if !materialize {
            if !cfg.fleet_hub {
                debug!(
                    "DocumentDB {} is not placed on member cluster {}",
                    name, cfg.cluster_name
                );
                return Ok(Action::await_change());
            }
            return self.reconcile_hub_only(ctx.clone(), cfg, &ddbs).await;
        }

        // Credential secret: existence only, content never copied
        if let Err(e) = resolve_credential_secret(self, ctx.clone()).await {
            return self
                .fail(ctx.clone(), "CredentialSecretMissing", &e.to_string())
                .await;
        }

        // TLS material must be ready before the Postgres cluster mounts it
        let tls_outcome = match tls::reconcile_tls(self, ctx.clone()).await {
            Ok(outcome) => outcome,
            Err(e) if e.is_terminal() => {
                return self.fail(ctx.clone(), "InvalidTlsConfig", &e.to_string()).await
            }
            Err(e) => {
                error!("Error reconciling TLS for {}: {:?}", name, e);
                return Err(Action::requeue(Duration::from_secs(60)));
            }
        };
        let tls_ready = tls_outcome.status.ready;
        let tls_secret_name = tls_outcome.status.secretName.clone();
        self.patch_status(
            &ddbs,
            json!({"status": {"tls": &tls_outcome.status, "supportedApiVersions": SUPPORTED_API_VERSIONS}}),
        )
        .await?;
        if !tls_ready {
            debug!("TLS not ready for {}, requeueing", name);
            return Ok(Action::requeue(Duration::from_secs(15)));
        }
        let tls_secret = tls_secret_name.expect("ready TLS always names a secret");

        // Bootstrap-from-backup resolution; a missing reference is terminal
        let recovery_snapshot = match resolve_bootstrap_backup(self, ctx.clone()).await {
            Ok(None) => None,
            Ok(Some(backup)) => {
                let phase = backup
                    .status
                    .as_ref()
                    .map(|s| s.phase)
                    .unwrap_or(BackupPhase::Pending);
                if phase != BackupPhase::Succeeded {
                    debug!("Bootstrap backup for {} not complete yet", name);
                    return Ok(Action::requeue(Duration::from_secs(30)));
                }
                Some(
                    backup
                        .status
                        .as_ref()
                        .and_then(|s| s.snapshotName.clone())
                        .unwrap_or_else(|| backup.name_any()),
                )
            }
            Err(Error::BackupNotFoundError(msg)) => {
                return self.fail(ctx.clone(), "BackupNotFound", &msg).await;
            }
            Err(e) => {
                error!("Error resolving bootstrap backup for {}: {:?}", name, e);
                return Err(Action::requeue(Duration::from_secs(60)));
            }
        };

        // Promotion token, when one is currently published here
        let token = read_token(self, ctx.clone()).await.unwrap_or(None);

        let inputs = ClusterInputs {
            tls_secret,
            recovery_snapshot,
            role: role.clone(),
            token,
        };
        reconcile_cnpg(self, ctx.clone(), cfg, &inputs).await?;

        reconcile_exposure_service(self, ctx.clone(), cfg).await?;

        // Probe for a routable endpoint; LoadBalancer addresses may be pending
        let endpoint = match exposure_service_endpoint(self, ctx.clone()).await {
            Ok(endpoint) => Some(endpoint),
            // While provisioning the address may legitimately not exist yet;
            // the phase machine sees endpoint_ready=false and we fall through
            // to the status write instead of looping without one.
            Err(_)
                if matches!(
                    current_phase,
                    DocumentDBPhase::Pending | DocumentDBPhase::Provisioning
                ) =>
            {
                None
            }
            Err(action) => return Err(action),
        };

        let connection = endpoint
            .as_ref()
            .map(|e| connection_string(self, e, cfg.gateway_port));

        // Observe the Postgres cluster for the phase machine
        let cluster = get_cluster(self, ctx.clone()).await.unwrap_or(None);
        let cluster_exists = cluster.is_some();
        let cluster_ready = cluster.as_ref().map(Cluster::is_ready).unwrap_or(false);
        let cluster_health = cluster
            .as_ref()
            .and_then(|c| c.status.as_ref())
            .and_then(|s| s.phase.clone());

        let previous_streak = self
            .status
            .as_ref()
            .and_then(|s| s.consecutiveUnready)
            .unwrap_or(0);
        let consecutive_unready = if cluster_ready { 0 } else { previous_streak + 1 };

        // Hub coordination runs after the local children are in shape
        let mut promotion_action = None;
        if cfg.fleet_hub && replication.is_some() {
            match reconcile_replication(self, ctx.clone(), cfg).await {
                Ok(action) => promotion_action = action,
                Err(e) if e.is_terminal() => {
                    return self
                        .fail(ctx.clone(), "ReplicationConfigInvalid", &e.to_string())
                        .await
                }
                Err(e) => {
                    warn!("Cross-cluster pass failed for {}: {:?}", name, e);
                    promotion_action = Some(Action::requeue(Duration::from_secs(30)));
                }
            }
        }

        let desired_primary = replication.as_ref().map(|r| r.primary.clone());
        let observed_primary = match &replication {
            // Member view: the primary is observed once this member is healthy
            Some(_) if !cfg.fleet_hub => match (cluster_ready, &desired_primary) {
                (true, Some(primary)) => Some(primary.clone()),
                _ => self.status.as_ref().and_then(|s| s.primary.clone()),
            },
            // Hub view is owned by the coordinator
            Some(_) => self.status.as_ref().and_then(|s| s.primary.clone()),
            None => Some(cfg.cluster_name.clone()),
        };

        let phase_inputs = PhaseInputs {
            deleting: false,
            tls_ready: true,
            cluster_exists,
            cluster_ready,
            endpoint_ready: endpoint.is_some(),
            consecutive_unready,
            observed_primary: observed_primary.clone(),
            desired_primary: desired_primary.clone(),
            promotion_in_progress: promotion_action.is_some(),
            terminal_failure: false,
        };
        let phase = next_phase(current_phase, &phase_inputs);

        let replication_status = role.clone().map(|role| ReplicationStatus {
            role: Some(role),
            promotion: None,
        });
        let mut status = json!({
            "status": {
                "phase": phase,
                "connectionString": connection,
                "status": cluster_health,
                "consecutiveUnready": consecutive_unready,
                "supportedApiVersions": SUPPORTED_API_VERSIONS,
            }
        });
        if let Some(primary) = &observed_primary {
            if !cfg.fleet_hub || replication.is_none() {
                status["status"]["primary"] = json!(primary);
            }
        }
        if let Some(replication_status) = &replication_status {
            // Merge-patch keeps any in-flight promotion block intact
            status["status"]["replication"] = json!({"role": replication_status.role});
        }
        self.patch_status(&ddbs, status).await?;

        if let Some(action) = promotion_action {
            return Ok(action);
        }
        if phase != DocumentDBPhase::Ready {
            debug!("DocumentDB {} in phase {}, requeueing", name, phase);
            return Ok(Action::requeue(Duration::from_secs(15)));
        }

        info!("Fully reconciled {}", self.name_any());
        // Check back every 60-90 seconds
        let jitter = rand::thread_rng().gen_range(0..30);
        Ok(Action::requeue(Duration::from_secs(60 + jitter)))
    }

    /// Hub clusters that are not members of the replication topology only run
    /// the coordinator and mirror its progress on status.
    async fn reconcile_hub_only(
        &self,
        ctx: Arc<Context>,
        cfg: &Config,
        ddbs: &Api<DocumentDB>,
    ) -> Result<Action, Action> {
        let promotion_action = match reconcile_replication(self, ctx.clone(), cfg).await {
            Ok(action) => action,
            Err(e) if e.is_terminal() => {
                return self
                    .fail(ctx.clone(), "ReplicationConfigInvalid", &e.to_string())
                    .await
            }
            Err(e) => {
                warn!("Cross-cluster pass failed for {}: {:?}", self.name_any(), e);
                return Err(Action::requeue(Duration::from_secs(30)));
            }
        };
        let phase = match promotion_action {
            Some(_) => DocumentDBPhase::Promoting,
            None => DocumentDBPhase::Ready,
        };
        self.patch_status(
            ddbs,
            json!({"status": {"phase": phase, "supportedApiVersions": SUPPORTED_API_VERSIONS}}),
        )
        .await?;
        match promotion_action {
            Some(action) => Ok(action),
            None => {
                let jitter = rand::thread_rng().gen_range(0..30);
                Ok(Action::requeue(Duration::from_secs(60 + jitter)))
            }
        }
    }

    /// Record a Config-class failure: phase Failed with a stable reason, no
    /// requeue until the spec changes.
    async fn fail(
        &self,
        ctx: Arc<Context>,
        reason: &str,
        message: &str,
    ) -> Result<Action, Action> {
        let ns = self.namespace().unwrap();
        let name = self.name_any();
        let ddbs: Api<DocumentDB> = Api::namespaced(ctx.client.clone(), &ns);
        error!("DocumentDB {} failed: {}: {}", name, reason, message);

        let conditions = upsert_condition(
            self.status.as_ref().and_then(|s| s.conditions.as_ref()),
            new_condition("Failed", "True", reason, message, self.metadata.generation),
        );
        self.patch_status(
            &ddbs,
            json!({"status": {
                "phase": DocumentDBPhase::Failed,
                "status": message,
                "conditions": conditions,
            }}),
        )
        .await?;

        let recorder = ctx.diagnostics.read().await.recorder(ctx.client.clone(), self);
        let _ = recorder
            .publish(Event {
                type_: EventType::Warning,
                reason: reason.into(),
                note: Some(message.to_string()),
                action: "Reconciling".into(),
                secondary: None,
            })
            .await;
        Ok(Action::await_change())
    }

    async fn patch_status(
        &self,
        api: &Api<DocumentDB>,
        patch: serde_json::Value,
    ) -> Result<(), Action> {
        patch_ddb_status_merge(api, &self.name_any(), patch)
            .await
            .map_err(|e| {
                error!("Error updating DocumentDB status: {:?}", e);
                Action::requeue(Duration::from_secs(10))
            })
    }

    // Finalizer cleanup (the object was deleted, ensure nothing is orphaned)
    #[instrument(skip(self, ctx))]
    async fn cleanup(&self, ctx: Arc<Context>) -> Result<Action> {
        // If namespace is terminating, do not publish delete event. Attempting to publish an event
        // in a terminating namespace will leave us in a bad state in which the namespace will hang
        // in terminating state.
        let ns_api: Api<Namespace> = Api::all(ctx.client.clone());
        let ns_status = ns_api
            .get_status(self.metadata.namespace.as_ref().unwrap())
            .await
            .map_err(Error::KubeError);
        let phase = ns_status.unwrap().status.unwrap().phase;
        if phase == Some("Terminating".to_string()) {
            return Ok(Action::await_change());
        }

        // The exposure service is deleted explicitly; every other child is
        // cascade-deleted through its owner reference. Backups intentionally
        // survive and are collected by the GC when their retention lapses.
        let _ = delete_exposure_service(self, ctx.clone()).await;

        let recorder = ctx.diagnostics.read().await.recorder(ctx.client.clone(), self);
        recorder
            .publish(Event {
                type_: EventType::Normal,
                reason: "DeleteDocumentDB".into(),
                note: Some(format!("Delete `{}`", self.name_any())),
                action: "Reconciling".into(),
                secondary: None,
            })
            .await
            .map_err(Error::KubeError)?;
        Ok(Action::await_change())
    }
}

pub async fn patch_ddb_status_merge(
    ddbs: &Api<DocumentDB>,
    name: &str,
    patch: serde_json::Value,
) -> Result<(), Error> {
    let pp = PatchParams {
        field_manager: Some("cntrlr".to_string()),
        ..PatchParams::default()
    };
    let patch_status = Patch::Merge(patch.clone());

    match ddbs.patch_status(name, &pp, &patch_status).await {
        Ok(_) => {
            debug!("Successfully updated DocumentDB status for {}", name);
            Ok(())
        }
        Err(e) => {
            error!("Error updating DocumentDB status for {}: {:?}", name, e);
            Err(Error::KubeError(e))
        }
    }
}

/// Diagnostics to be exposed by the web server
#[derive(Clone, Serialize)]
pub struct Diagnostics {
    #[serde(deserialize_with = "from_ts")]
    pub last_event: DateTime<Utc>,
    #[serde(skip)]
    pub reporter: Reporter,
}
impl Default for Diagnostics {
    fn default() -> Self {
        Self {
            last_event: Utc::now(),
            reporter: "documentdb-controller".into(),
        }
    }
}
impl Diagnostics {
    fn recorder(&self, client: Client, ddb: &DocumentDB) -> Recorder {
        Recorder::new(client, self.reporter.clone(), ddb.object_ref(&()))
    }
}

/// State shared between the controller and the web server
#[derive(Clone, Default)]
pub struct State {
    /// Diagnostics populated by the reconciler
    diagnostics: Arc<RwLock<Diagnostics>>,
    /// Metrics registry
    registry: prometheus::Registry,
}

/// State wrapper around the controller outputs for the web server
impl State {
    /// Metrics getter
    pub fn metrics(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    /// State getter
    pub async fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.read().await.clone()
    }

    // Create a Controller Context that can update State
    pub fn create_context(&self, client: Client) -> Arc<Context> {
        Arc::new(Context {
            client,
            metrics: Metrics::default().register(&self.registry).unwrap(),
            diagnostics: self.diagnostics.clone(),
        })
    }
}

/// Initialize the controllers and shared state (given the crds are installed)
pub async fn run(state: State) {
    let client = match Client::try_default().await {
        Ok(wrapped_client) => wrapped_client,
        Err(_) => panic!("Please configure your Kubernetes Context"),
    };

    let ddbs = Api::<DocumentDB>::all(client.clone());
    if let Err(e) = ddbs.list(&ListParams::default().limit(1)).await {
        error!("CRD is not queryable; {e:?}. Is the CRD installed?");
        info!("Installation: cargo run --bin crdgen | kubectl apply -f -");
        std::process::exit(1);
    }
    let backups = Api::<Backup>::all(client.clone());
    let scheduled_backups = Api::<ScheduledBackup>::all(client.clone());
    let ctx = state.create_context(client.clone());

    let ddb_controller = Controller::new(ddbs, watcherConfig::default().any_semantic())
        .owns(
            Api::<Cluster>::all(client.clone()),
            watcherConfig::default().any_semantic(),
        )
        .owns(
            Api::<Service>::all(client.clone()),
            watcherConfig::default().any_semantic(),
        )
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx.clone())
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()));

    let backup_controller = Controller::new(backups, watcherConfig::default().any_semantic())
        .shutdown_on_signal()
        .run(reconcile_backup, backup_error_policy, ctx.clone())
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()));

    let scheduled_backup_controller =
        Controller::new(scheduled_backups, watcherConfig::default().any_semantic())
            .shutdown_on_signal()
            .run(
                reconcile_scheduled_backup,
                scheduled_backup_error_policy,
                ctx.clone(),
            )
            .filter_map(|x| async move { std::result::Result::ok(x) })
            .for_each(|_| futures::future::ready(()));

    tokio::select! {
        _ = ddb_controller => {},
        _ = backup_controller => {},
        _ = scheduled_backup_controller => {},
        _ = run_backup_gc(client.clone()) => {},
    }
}
