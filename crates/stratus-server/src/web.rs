//! Admin HTTP API.
//!
//! JSON over HTTP with basic auth (`admin:<password>`), serving CRUD for
//! zones, credentials, notify targets and provider configs, record-set
//! changes, zone import, per-rrset history, a consistent database export,
//! and the prometheus metrics (unauthenticated).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::Engine;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;

use stratus_common::name::{absolute_name, clean_abs_name};
use stratus_common::types::{
    Credential, CredentialKind, NotifyProtocol, ProviderConfig, ProviderRecord,
    Record, RecordKey, Zone, ZoneCredential, ZoneNotify, RTYPE_SOA,
};
use stratus_common::Error;
use stratus_dns::record::parse_provider_record;

use crate::hist::propagation_states;
use crate::metrics;
use crate::sync::{ensure_propagate, latest_records, sync_records};
use crate::App;

/// Deadline for a full zone import.
const IMPORT_TIMEOUT: Duration = Duration::from_secs(60);

struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        ApiError(err)
    }
}

impl From<crate::store::StoreError> for ApiError {
    fn from(err: crate::store::StoreError) -> Self {
        ApiError(err.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self.0 {
            Error::NotFound(_) => (StatusCode::NOT_FOUND, "user:notFound"),
            Error::UserInput(_) => (StatusCode::BAD_REQUEST, "user:error"),
            Error::Permission(_) => (StatusCode::FORBIDDEN, "user:permission"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "server:error"),
        };
        let body = json!({ "code": code, "message": self.0.to_string() });
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

pub async fn serve(app: Arc<App>, listener: tokio::net::TcpListener) {
    let router = router(app.clone());
    let mut shutdown = app.shutdown.clone();
    let serve = axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = shutdown.changed().await;
    });
    if let Err(e) = serve.await {
        info!(err = %e, "admin http server stopped");
    }
}

pub fn router(app: Arc<App>) -> Router {
    let api = Router::new()
        .route("/zones", get(zones_list).post(zone_add))
        .route(
            "/zones/{name}",
            get(zone_get).put(zone_update).delete(zone_delete),
        )
        .route("/zones/{name}/refresh", post(zone_refresh))
        .route("/zones/{name}/purge-history", post(zone_purge_history))
        .route("/zones/{name}/records", get(zone_records))
        .route("/zones/{name}/sets", get(zone_record_sets))
        .route("/zones/{name}/history", get(zone_record_set_history))
        .route("/zones/{name}/set-add", post(record_set_add))
        .route("/zones/{name}/set-update", post(record_set_update))
        .route("/zones/{name}/set-delete", post(record_set_delete))
        .route("/zones/{name}/import", post(zone_import))
        .route("/zones/{name}/notify", post(zone_notify_now))
        .route("/zones/{name}/credentials", post(zone_credential_add))
        .route("/notifies", post(notify_add))
        .route("/notifies/{id}", axum::routing::delete(notify_delete))
        .route("/credentials", post(credential_add))
        .route("/credentials/{id}", axum::routing::delete(credential_delete))
        .route(
            "/zonecredentials/{id}",
            axum::routing::delete(zone_credential_delete),
        )
        .route(
            "/providerconfigs",
            get(provider_configs).post(provider_config_add),
        )
        .route(
            "/providerconfigs/{name}",
            axum::routing::put(provider_config_update)
                .delete(provider_config_delete),
        )
        .route("/providerconfigs/test", post(provider_config_test))
        .route("/version", get(version))
        .route("/export", get(export))
        .layer(middleware::from_fn_with_state(app.clone(), basic_auth));

    Router::new()
        .nest("/api", api)
        .route("/metrics", get(metrics_text))
        .layer(TraceLayer::new_for_http())
        .with_state(app)
}

async fn basic_auth(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
    request: axum::extract::Request,
    next: Next,
) -> Response {
    let expected = base64::engine::general_purpose::STANDARD
        .encode(format!("admin:{}", app.admin_password));
    let ok = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Basic "))
        .map(|got| got == expected)
        .unwrap_or(false);
    if !ok {
        return (
            StatusCode::UNAUTHORIZED,
            [(header::WWW_AUTHENTICATE, "Basic realm=\"stratus\"")],
            "authentication required",
        )
            .into_response();
    }
    next.run(request).await
}

async fn metrics_text() -> Response {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::render(),
    )
        .into_response()
}

async fn version(State(app): State<Arc<App>>) -> Json<serde_json::Value> {
    Json(json!({ "version": app.version }))
}

// Zones.

async fn zones_list(State(app): State<Arc<App>>) -> ApiResult<Json<Vec<Zone>>> {
    let mut zones = app.store.read_async(|tx| tx.zones()).await?;
    zones.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(Json(zones))
}

#[derive(Deserialize)]
struct ZoneAddRequest {
    name: String,
    provider_config: String,
    #[serde(default = "default_sync_interval")]
    sync_interval_seconds: u64,
    #[serde(default = "default_refresh_interval")]
    refresh_interval_seconds: u64,
}

fn default_sync_interval() -> u64 {
    3600
}

fn default_refresh_interval() -> u64 {
    86400
}

#[derive(Serialize)]
struct ZoneAddResponse {
    zone: Zone,
    /// Auto-created TSIG credential for the zone, secret included; shown
    /// once.
    credential: Credential,
    tsig_secret: String,
}

async fn zone_add(
    State(app): State<Arc<App>>,
    Json(req): Json<ZoneAddRequest>,
) -> ApiResult<Json<ZoneAddResponse>> {
    let name = clean_abs_name(&req.name)?;
    let now = Utc::now();
    let zone = Zone {
        name: name.clone(),
        provider_config: req.provider_config,
        serial_local: 0,
        serial_remote: 0,
        last_sync: None,
        last_record_change: None,
        sync_interval: Duration::from_secs(req.sync_interval_seconds),
        refresh_interval: Duration::from_secs(req.refresh_interval_seconds),
        next_sync: now,
        next_refresh: now,
    };

    // Every zone gets a TSIG credential of its own name.
    let mut secret = [0u8; 32];
    rand::Rng::fill(&mut rand::thread_rng(), &mut secret);
    let tsig_secret = base64::engine::general_purpose::STANDARD.encode(secret);
    let credential = Credential {
        id: Uuid::now_v7(),
        created: now,
        name: name.trim_end_matches('.').to_string(),
        kind: CredentialKind::Tsig,
        tsig_secret: tsig_secret.clone(),
        tls_public_key: String::new(),
    };

    let zone_clone = zone.clone();
    let credential_clone = credential.clone();
    app.store
        .write_async(move |tx| {
            tx.zone_insert(&zone_clone)?;
            tx.credential_insert(&credential_clone)?;
            tx.zone_credential_insert(&ZoneCredential {
                id: Uuid::now_v7(),
                zone: zone_clone.name.clone(),
                credential_id: credential_clone.id,
            })
        })
        .await?;

    // The refresher picks the new zone up immediately.
    app.refresh_kick.notify_one();

    Ok(Json(ZoneAddResponse {
        zone,
        credential,
        tsig_secret,
    }))
}

#[derive(Serialize)]
struct ZoneDetail {
    zone: Zone,
    provider_config: ProviderConfig,
    notifies: Vec<ZoneNotify>,
    credentials: Vec<Credential>,
}

async fn zone_get(
    State(app): State<Arc<App>>,
    Path(name): Path<String>,
) -> ApiResult<Json<ZoneDetail>> {
    let name = clean_abs_name(&name)?;
    let detail = app
        .store
        .read_async(move |tx| {
            let (zone, provider_config) = tx.zone_and_config(&name)?;
            let notifies = tx.zone_notifies(&name)?;
            let mut credentials = Vec::new();
            for link in tx.zone_credentials(&name)? {
                credentials.push(tx.credential(link.credential_id)?);
            }
            Ok(ZoneDetail {
                zone,
                provider_config,
                notifies,
                credentials,
            })
        })
        .await?;
    Ok(Json(detail))
}

#[derive(Deserialize)]
struct ZoneUpdateRequest {
    provider_config: Option<String>,
    sync_interval_seconds: Option<u64>,
    refresh_interval_seconds: Option<u64>,
}

async fn zone_update(
    State(app): State<Arc<App>>,
    Path(name): Path<String>,
    Json(req): Json<ZoneUpdateRequest>,
) -> ApiResult<Json<Zone>> {
    let name = clean_abs_name(&name)?;
    let zone = app
        .store
        .write_async(move |tx| {
            let mut zone = tx.zone(&name)?;
            if let Some(pc) = req.provider_config {
                tx.provider_config(&pc)?;
                zone.provider_config = pc;
            }
            if let Some(secs) = req.sync_interval_seconds {
                zone.sync_interval = Duration::from_secs(secs);
            }
            if let Some(secs) = req.refresh_interval_seconds {
                zone.refresh_interval = Duration::from_secs(secs);
            }
            tx.zone_update(&zone)?;
            Ok(zone)
        })
        .await?;
    app.refresh_kick.notify_one();
    Ok(Json(zone))
}

async fn zone_delete(
    State(app): State<Arc<App>>,
    Path(name): Path<String>,
) -> ApiResult<StatusCode> {
    let name = clean_abs_name(&name)?;
    let _guard = app.locks.lock(&name).await;
    app.store.write_async(move |tx| tx.zone_delete(&name)).await?;
    app.refresh_kick.notify_one();
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Serialize)]
struct RefreshResponse {
    changed: bool,
    inserted: usize,
    deleted: usize,
}

/// Admin-initiated immediate sync.
async fn zone_refresh(
    State(app): State<Arc<App>>,
    Path(name): Path<String>,
) -> ApiResult<Json<RefreshResponse>> {
    let name = clean_abs_name(&name)?;
    let (zone, gateway) = zone_gateway(&app, &name).await?;

    let _guard = app.locks.lock(&zone.name).await;
    let latest = latest_records(&gateway, &zone.name).await?;
    let zone_clone = zone.clone();
    let outcome = app
        .store
        .write_async(move |tx| {
            sync_records(tx, &zone_clone, &latest)
                .map_err(|e| crate::store::StoreError::Database(e.to_string()))
        })
        .await?;
    if outcome.changed {
        crate::sync::spawn_zone_notify(app.clone(), zone.name.clone());
    }
    Ok(Json(RefreshResponse {
        changed: outcome.changed,
        inserted: outcome.inserted.len(),
        deleted: outcome.deleted.len(),
    }))
}

async fn zone_purge_history(
    State(app): State<Arc<App>>,
    Path(name): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let name = clean_abs_name(&name)?;
    let _guard = app.locks.lock(&name).await;
    let purged = app
        .store
        .write_async(move |tx| {
            tx.zone(&name)?;
            tx.purge_history(&name)
        })
        .await?;
    Ok(Json(json!({ "purged": purged })))
}

async fn zone_records(
    State(app): State<Arc<App>>,
    Path(name): Path<String>,
) -> ApiResult<Json<Vec<Record>>> {
    let name = clean_abs_name(&name)?;
    let records = app
        .store
        .read_async(move |tx| {
            tx.zone(&name)?;
            tx.records_all(&name)
        })
        .await?;
    Ok(Json(records))
}

async fn zone_record_sets(
    State(app): State<Arc<App>>,
    Path(name): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let name = clean_abs_name(&name)?;
    let records = app
        .store
        .read_async(move |tx| {
            tx.zone(&name)?;
            tx.records_all(&name)
        })
        .await?;
    let sets = propagation_states(Utc::now(), records, "", None, true)?;
    let out: Vec<_> = sets
        .into_iter()
        .map(|(key, versions)| json!({ "key": key, "versions": versions }))
        .collect();
    Ok(Json(json!(out)))
}

#[derive(Deserialize)]
struct HistoryQuery {
    name: String,
    #[serde(rename = "type")]
    rtype: String,
}

async fn zone_record_set_history(
    State(app): State<Arc<App>>,
    Path(name): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let name = clean_abs_name(&name)?;
    let rtype = rtype_from_str(&query.rtype)?;
    let records = app
        .store
        .read_async({
            let name = name.clone();
            move |tx| {
                tx.zone(&name)?;
                tx.records_all(&name)
            }
        })
        .await?;
    let sets = propagation_states(
        Utc::now(),
        records,
        &query.name,
        Some(rtype),
        false,
    )?;
    let states = sets
        .into_values()
        .next()
        .and_then(|versions| versions.into_iter().next_back())
        .map(|set| set.states)
        .unwrap_or_default();
    Ok(Json(json!(states)))
}

fn rtype_from_str(s: &str) -> Result<u16, Error> {
    use std::str::FromStr;
    domain::base::iana::Rtype::from_str(s)
        .map(|t| t.to_int())
        .map_err(|_| Error::user(format!("unknown record type {s:?}")))
}

// Record set changes through the provider.

#[derive(Deserialize)]
struct RecordSetChange {
    rel_name: String,
    #[serde(rename = "type")]
    rtype: String,
    ttl: u32,
    values: Vec<String>,
}

async fn record_set_add(
    State(app): State<Arc<App>>,
    Path(name): Path<String>,
    Json(change): Json<RecordSetChange>,
) -> ApiResult<Json<Vec<Record>>> {
    let name = clean_abs_name(&name)?;
    let (zone, gateway) = zone_gateway(&app, &name).await?;
    rtype_from_str(&change.rtype)?;

    let guard = app.locks.lock(&zone.name).await;

    let mut exp_add: Vec<RecordKey> = Vec::new();
    let mut to_append: Vec<ProviderRecord> = Vec::new();
    for value in &change.values {
        let abs = absolute_name(&change.rel_name, &zone.name);
        let wire =
            parse_provider_record(&abs, change.ttl, &change.rtype, value, "")?;
        exp_add.push(wire.record_key());
        to_append.push(ProviderRecord {
            id: String::new(),
            rtype: change.rtype.clone(),
            name: change.rel_name.clone(),
            value: value.clone(),
            ttl: change.ttl,
        });
    }

    gateway.append_records(&zone.name, to_append).await?;
    let (inserted, _) =
        ensure_propagate(&app, guard, &gateway, &zone, exp_add, Vec::new(), 0)
            .await?;
    Ok(Json(inserted))
}

async fn record_set_update(
    State(app): State<Arc<App>>,
    Path(name): Path<String>,
    Json(change): Json<RecordSetChange>,
) -> ApiResult<Json<Vec<Record>>> {
    let name = clean_abs_name(&name)?;
    let (zone, gateway) = zone_gateway(&app, &name).await?;
    let rtype = rtype_from_str(&change.rtype)?;
    let abs = absolute_name(&change.rel_name, &zone.name);

    let guard = app.locks.lock(&zone.name).await;

    // Replace the whole rrset: delete current values, append new ones.
    let zone_name = zone.name.clone();
    let abs_clone = abs.clone();
    let current: Vec<Record> = app
        .store
        .read_async(move |tx| {
            Ok(tx
                .live_records(&zone_name)?
                .into_iter()
                .filter(|r| r.abs_name == abs_clone && r.rtype == rtype)
                .collect())
        })
        .await?;

    let mut exp_add = Vec::new();
    let mut to_append = Vec::new();
    for value in &change.values {
        let wire =
            parse_provider_record(&abs, change.ttl, &change.rtype, value, "")?;
        exp_add.push(wire.record_key());
        to_append.push(ProviderRecord {
            id: String::new(),
            rtype: change.rtype.clone(),
            name: change.rel_name.clone(),
            value: value.clone(),
            ttl: change.ttl,
        });
    }

    if !current.is_empty() {
        let to_delete = current
            .iter()
            .map(stratus_dns::record::to_provider_record)
            .collect();
        gateway.delete_records(&zone.name, to_delete).await?;
    }
    gateway.append_records(&zone.name, to_append).await?;
    let (inserted, _) =
        ensure_propagate(&app, guard, &gateway, &zone, exp_add, current, 0)
            .await?;
    Ok(Json(inserted))
}

async fn record_set_delete(
    State(app): State<Arc<App>>,
    Path(name): Path<String>,
    Json(change): Json<RecordSetChange>,
) -> ApiResult<Json<Vec<Record>>> {
    let name = clean_abs_name(&name)?;
    let (zone, gateway) = zone_gateway(&app, &name).await?;
    let rtype = rtype_from_str(&change.rtype)?;
    let abs = absolute_name(&change.rel_name, &zone.name);

    let guard = app.locks.lock(&zone.name).await;

    let zone_name = zone.name.clone();
    let current: Vec<Record> = app
        .store
        .read_async(move |tx| {
            Ok(tx
                .live_records(&zone_name)?
                .into_iter()
                .filter(|r| r.abs_name == abs && r.rtype == rtype)
                .collect())
        })
        .await?;
    if current.is_empty() {
        return Err(ApiError(Error::not_found("record set".to_string())));
    }

    let to_delete = current
        .iter()
        .map(stratus_dns::record::to_provider_record)
        .collect();
    gateway.delete_records(&zone.name, to_delete).await?;
    let (_, deleted) =
        ensure_propagate(&app, guard, &gateway, &zone, Vec::new(), current, 0)
            .await?;
    Ok(Json(deleted))
}

#[derive(Deserialize)]
struct ImportRequest {
    zonefile: String,
}

/// Imports records from zone-file text by appending them through the
/// provider. SOA records are skipped; the provider owns the SOA.
async fn zone_import(
    State(app): State<Arc<App>>,
    Path(name): Path<String>,
    Json(req): Json<ImportRequest>,
) -> ApiResult<Json<Vec<Record>>> {
    let name = clean_abs_name(&name)?;
    let (zone, gateway) = zone_gateway(&app, &name).await?;

    use domain::zonefile::inplace::{Entry, Zonefile};
    let mut zonefile = Zonefile::from(req.zonefile.as_str());
    let origin = zone
        .name
        .parse()
        .map_err(|_| Error::user("zone name as origin"))?;
    zonefile.set_origin(origin);
    let mut to_append = Vec::new();
    let mut exp_add = Vec::new();
    loop {
        let entry = zonefile
            .next_entry()
            .map_err(|e| Error::user(format!("parsing zonefile: {e}")))?;
        let Some(entry) = entry else { break };
        let Entry::Record(rec) = entry else { continue };
        if rec.rtype().to_int() == RTYPE_SOA {
            continue;
        }
        let owner = rec
            .owner()
            .to_dname::<Vec<u8>>()
            .map_err(|e| Error::user(format!("record owner: {e}")))?;
        let abs = stratus_dns::record::abs_string(&owner);
        let rtype = rec.rtype().to_string();
        let value = rec.data().to_string();
        let wire = parse_provider_record(&abs, rec.ttl(), &rtype, &value, "")?;
        exp_add.push(wire.record_key());
        to_append.push(ProviderRecord {
            id: String::new(),
            rtype,
            name: stratus_common::name::relative_name(&abs, &zone.name),
            value,
            ttl: rec.ttl(),
        });
    }
    if to_append.is_empty() {
        return Err(ApiError(Error::user("no records in zonefile")));
    }

    let guard = app.locks.lock(&zone.name).await;
    let imported = tokio::time::timeout(IMPORT_TIMEOUT, async {
        gateway.append_records(&zone.name, to_append).await?;
        let (inserted, _) =
            ensure_propagate(&app, guard, &gateway, &zone, exp_add, Vec::new(), 0)
                .await?;
        Ok::<_, Error>(inserted)
    })
    .await
    .map_err(|_| Error::transient("zone import timed out"))??;
    Ok(Json(imported))
}

/// Sends NOTIFY to all registered targets now.
async fn zone_notify_now(
    State(app): State<Arc<App>>,
    Path(name): Path<String>,
) -> ApiResult<StatusCode> {
    let name = clean_abs_name(&name)?;
    app.store
        .read_async({
            let name = name.clone();
            move |tx| tx.zone(&name)
        })
        .await?;
    crate::sync::send_zone_notify(&app, &name).await;
    Ok(StatusCode::ACCEPTED)
}

// Notify targets.

#[derive(Deserialize)]
struct NotifyAddRequest {
    zone: String,
    address: String,
    protocol: NotifyProtocol,
}

async fn notify_add(
    State(app): State<Arc<App>>,
    Json(req): Json<NotifyAddRequest>,
) -> ApiResult<Json<ZoneNotify>> {
    let zone = clean_abs_name(&req.zone)?;
    req.address
        .parse::<SocketAddr>()
        .map_err(|e| Error::user(format!("notify address: {e}")))?;
    let target = ZoneNotify {
        id: Uuid::now_v7(),
        created: Utc::now(),
        zone,
        address: req.address,
        protocol: req.protocol,
    };
    let clone = target.clone();
    app.store
        .write_async(move |tx| tx.zone_notify_insert(&clone))
        .await?;
    Ok(Json(target))
}

async fn notify_delete(
    State(app): State<Arc<App>>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    app.store
        .write_async(move |tx| tx.zone_notify_delete(id))
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

// Credentials.

#[derive(Deserialize)]
struct CredentialAddRequest {
    name: String,
    kind: CredentialKind,
    #[serde(default)]
    tsig_secret: String,
    #[serde(default)]
    tls_public_key: String,
}

async fn credential_add(
    State(app): State<Arc<App>>,
    Json(req): Json<CredentialAddRequest>,
) -> ApiResult<Json<Credential>> {
    match req.kind {
        CredentialKind::Tsig => {
            base64::engine::general_purpose::STANDARD
                .decode(&req.tsig_secret)
                .map_err(|e| Error::user(format!("tsig secret: {e}")))?;
        }
        CredentialKind::TlsPublicKey => {
            let raw = base64::engine::general_purpose::URL_SAFE_NO_PAD
                .decode(&req.tls_public_key)
                .map_err(|e| Error::user(format!("tls public key: {e}")))?;
            if raw.len() != 32 {
                return Err(ApiError(Error::user(
                    "tls public key must be a sha-256 hash (32 bytes)",
                )));
            }
        }
    }
    let credential = Credential {
        id: Uuid::now_v7(),
        created: Utc::now(),
        name: req.name,
        kind: req.kind,
        tsig_secret: req.tsig_secret,
        tls_public_key: req.tls_public_key,
    };
    let clone = credential.clone();
    app.store
        .write_async(move |tx| tx.credential_insert(&clone))
        .await?;
    Ok(Json(credential))
}

async fn credential_delete(
    State(app): State<Arc<App>>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    app.store
        .write_async(move |tx| tx.credential_delete(id))
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct ZoneCredentialAddRequest {
    credential_id: Uuid,
}

async fn zone_credential_add(
    State(app): State<Arc<App>>,
    Path(name): Path<String>,
    Json(req): Json<ZoneCredentialAddRequest>,
) -> ApiResult<Json<ZoneCredential>> {
    let zone = clean_abs_name(&name)?;
    let link = ZoneCredential {
        id: Uuid::now_v7(),
        zone,
        credential_id: req.credential_id,
    };
    let clone = link.clone();
    app.store
        .write_async(move |tx| tx.zone_credential_insert(&clone))
        .await?;
    Ok(Json(link))
}

async fn zone_credential_delete(
    State(app): State<Arc<App>>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    app.store
        .write_async(move |tx| tx.zone_credential_delete(id))
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

// Provider configs.

async fn provider_configs(
    State(app): State<Arc<App>>,
) -> ApiResult<Json<Vec<ProviderConfig>>> {
    Ok(Json(app.store.read_async(|tx| tx.provider_configs()).await?))
}

async fn provider_config_add(
    State(app): State<Arc<App>>,
    Json(pc): Json<ProviderConfig>,
) -> ApiResult<Json<ProviderConfig>> {
    // Fail early on unknown kinds or unparseable config.
    app.registry.open(&pc.name, &pc.provider, &pc.config)?;
    let clone = pc.clone();
    app.store
        .write_async(move |tx| tx.provider_config_insert(&clone))
        .await?;
    Ok(Json(pc))
}

async fn provider_config_update(
    State(app): State<Arc<App>>,
    Path(name): Path<String>,
    Json(mut pc): Json<ProviderConfig>,
) -> ApiResult<Json<ProviderConfig>> {
    pc.name = name;
    app.registry.open(&pc.name, &pc.provider, &pc.config)?;
    let clone = pc.clone();
    app.store
        .write_async(move |tx| tx.provider_config_update(&clone))
        .await?;
    Ok(Json(pc))
}

async fn provider_config_delete(
    State(app): State<Arc<App>>,
    Path(name): Path<String>,
) -> ApiResult<StatusCode> {
    app.store
        .write_async(move |tx| tx.provider_config_delete(&name))
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct ProviderTestRequest {
    provider: String,
    config: String,
    zone: String,
}

/// Opens the provider and lists the zone once, returning the record
/// count.
async fn provider_config_test(
    State(app): State<Arc<App>>,
    Json(req): Json<ProviderTestRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let zone = clean_abs_name(&req.zone)?;
    let gateway = app.registry.open("test", &req.provider, &req.config)?;
    let records = gateway.get_records(&zone).await?;
    Ok(Json(json!({ "records": records.len() })))
}

/// Consistent JSON snapshot of the whole database, taken inside one read
/// transaction.
async fn export(State(app): State<Arc<App>>) -> ApiResult<Json<serde_json::Value>> {
    let snapshot = app
        .store
        .read_async(|tx| {
            let zones = tx.zones()?;
            let provider_configs = tx.provider_configs()?;
            let credentials = tx.credentials()?;
            let mut records: HashMap<String, Vec<Record>> = HashMap::new();
            let mut notifies = HashMap::new();
            let mut zone_credentials = HashMap::new();
            for zone in &zones {
                records.insert(zone.name.clone(), tx.records_all(&zone.name)?);
                notifies.insert(zone.name.clone(), tx.zone_notifies(&zone.name)?);
                zone_credentials
                    .insert(zone.name.clone(), tx.zone_credentials(&zone.name)?);
            }
            Ok(json!({
                "zones": zones,
                "provider_configs": provider_configs,
                "credentials": credentials,
                "records": records,
                "notifies": notifies,
                "zone_credentials": zone_credentials,
            }))
        })
        .await?;
    Ok(Json(snapshot))
}

/// The zone row and a provider gateway for it.
async fn zone_gateway(
    app: &Arc<App>,
    name: &str,
) -> Result<(Zone, crate::providers::Gateway), Error> {
    let name = name.to_string();
    let (zone, config) = app
        .store
        .read_async(move |tx| tx.zone_and_config(&name))
        .await?;
    let gateway = app
        .registry
        .open(&config.name, &config.provider, &config.config)?;
    Ok((zone, gateway))
}
