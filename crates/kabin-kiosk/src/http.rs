//! Kiosk-local HTTP: the QR surface and health.
//!
//! `GET /lock/{id}` binds the browser to a device cookie and hands out a
//! 5-second action token; `POST /act` redeems it. The surface only serves
//! the local LAN: requests from public addresses, or whose Origin does not
//! match the Host header, are rejected before any state is touched.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::extract::{ConnectInfo, Path, State};
use axum::http::{header, HeaderMap};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use kabin_core::qr::{QrAction, QrTokenSigner, DEVICE_COOKIE_MAX_AGE_SECS};
use kabin_core::ratelimit::{self, MASTER_PIN, QR_DEVICE, QR_IP, QR_LOCKER};
use kabin_core::state::Actor;
use kabin_core::types::{EventType, LockerStatus, NewEvent, OwnerType};
use kabin_core::zone;

use crate::error::AppError;
use crate::state::{AppState, VERSION};

/// Build the kiosk router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/lock/{id}", get(lock_page))
        .route("/act", post(act))
        .route("/rfid/scan", post(rfid_scan))
        .route("/rfid/select", post(rfid_select))
        .route("/pin/open", post(pin_open))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ── GET /lock/{id} ───────────────────────────────────────────────────

async fn lock_page(
    State(app): State<Arc<AppState>>,
    Path(locker_id): Path<i64>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let (device_id, is_new_device) = match device_id_from(&headers) {
        Some(id) => (id, false),
        None => (kabin_core::qr::generate_device_id(), true),
    };

    let locker = app.state.get(&app.kiosk_id, locker_id).await?;
    if locker.is_vip {
        return Err(AppError::VipLocked);
    }

    let action = match (locker.status, locker.owner_type) {
        (LockerStatus::Free, _) => QrAction::Assign,
        (LockerStatus::Owned | LockerStatus::Reserved, OwnerType::Device)
            if locker.owner_key.as_deref() == Some(device_id.as_str()) =>
        {
            QrAction::Release
        }
        _ => return Err(AppError::Conflict("Dolap müsait değil".to_owned())),
    };

    let token = app.signer.issue(locker_id, &device_id, action, Utc::now());
    let label = locker.label();
    let verb = match action {
        QrAction::Assign => "Dolabı al",
        QrAction::Release => "Dolabı aç ve bırak",
    };
    let page = lock_html(&label, verb, &token);

    let mut response = Html(page).into_response();
    if is_new_device {
        if let Ok(value) = device_cookie(&device_id).parse() {
            response.headers_mut().insert(header::SET_COOKIE, value);
        }
    }
    Ok(response)
}

fn lock_html(label: &str, verb: &str, token: &str) -> String {
    format!(
        r#"<!doctype html>
<html lang="tr"><head><meta charset="utf-8">
<meta name="viewport" content="width=device-width, initial-scale=1">
<title>{label}</title></head>
<body>
<h1>{label}</h1>
<form method="post" action="/act" id="act">
<input type="hidden" name="token" value="{token}">
<button type="submit">{verb}</button>
</form>
<script>
const form = document.getElementById('act');
form.addEventListener('submit', async (e) => {{
  e.preventDefault();
  const res = await fetch('/act', {{
    method: 'POST',
    headers: {{'Content-Type': 'application/json'}},
    body: JSON.stringify({{token: form.token.value}})
  }});
  const body = await res.json();
  document.body.innerHTML = '<p>' + (body.message || 'Hata') + '</p>';
}});
</script>
</body></html>"#
    )
}

// ── POST /act ────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ActRequest {
    token: String,
}

#[derive(Debug, Serialize)]
struct ActResponse {
    success: bool,
    action: &'static str,
    message: String,
    locker_id: i64,
}

async fn act(
    State(app): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(request): Json<ActRequest>,
) -> Result<Json<ActResponse>, AppError> {
    check_origin(&headers, peer.ip())?;

    app.limiter
        .check(&ratelimit::qr_ip_key(&peer.ip().to_string()), QR_IP)?;

    let device_id = device_id_from(&headers).ok_or(AppError::Forbidden {
        code: "no_device",
        message: "Cihaz tanımlanamadı".to_owned(),
    })?;

    // The locker key comes from the (unverified) token so the per-locker
    // window counts forged attempts too; verification follows immediately.
    let locker_id = QrTokenSigner::peek_locker_id(&request.token)?;
    app.limiter
        .check(&ratelimit::qr_locker_key(locker_id), QR_LOCKER)?;
    app.limiter
        .check(&ratelimit::qr_device_key(&device_id), QR_DEVICE)?;

    let token = app
        .signer
        .verify(&request.token, locker_id, &device_id, Utc::now())?;

    let locker = app.state.get(&app.kiosk_id, locker_id).await?;

    let snapshot = app.config.snapshot().await;
    let coil = zone::resolve(&snapshot, locker_id)
        .map_err(|e| AppError::Conflict(e.to_string()))?;

    match token.action {
        QrAction::Assign => {
            if locker.is_vip {
                return Err(AppError::VipLocked);
            }
            app.state
                .reserve(
                    &app.kiosk_id,
                    locker_id,
                    OwnerType::Device,
                    &device_id,
                    Actor::system(),
                )
                .await?;

            if let Err(err) = app.driver.pulse(coil).await {
                app.state
                    .release(&app.kiosk_id, locker_id, Some(&device_id), Actor::system())
                    .await?;
                return Err(err.into());
            }
            app.state
                .confirm(&app.kiosk_id, locker_id, Actor::system())
                .await?;

            info!(kiosk_id = %app.kiosk_id, locker_id, "QR assign");
            Ok(Json(ActResponse {
                success: true,
                action: "assign",
                message: format!("{} atandı ve açıldı", locker.label()),
                locker_id,
            }))
        }
        QrAction::Release => {
            if locker.is_vip {
                // A release token for a VIP locker opens the door but the
                // contract binding stays; the audit trail records access,
                // not a surrender.
                app.driver.pulse(coil).await.map_err(AppError::from)?;
                app.events
                    .append(
                        NewEvent::new(EventType::VipAccess)
                            .kiosk(&app.kiosk_id)
                            .locker(locker_id),
                    )
                    .await
                    .map_err(|e| AppError::Internal(e.to_string()))?;

                info!(kiosk_id = %app.kiosk_id, locker_id, "QR VIP access");
                return Ok(Json(ActResponse {
                    success: true,
                    action: "release",
                    message: format!("{} açıldı", locker.label()),
                    locker_id,
                }));
            }
            if locker.owner_type != OwnerType::Device
                || locker.owner_key.as_deref() != Some(device_id.as_str())
            {
                return Err(AppError::Forbidden {
                    code: "not_owner",
                    message: "Bu dolap bu cihaza ait değil".to_owned(),
                });
            }

            app.driver.pulse(coil).await.map_err(AppError::from)?;
            app.state
                .release(&app.kiosk_id, locker_id, Some(&device_id), Actor::system())
                .await?;

            info!(kiosk_id = %app.kiosk_id, locker_id, "QR release");
            Ok(Json(ActResponse {
                success: true,
                action: "release",
                message: format!("{} açıldı ve bırakıldı", locker.label()),
                locker_id,
            }))
        }
    }
}

// ── POST /rfid/scan and /rfid/select ─────────────────────────────────
//
// Fed by the RFID reader driver on the kiosk itself; debouncing of
// hardware bounce happens upstream, card numbers arrive as strings.

#[derive(Debug, Deserialize)]
struct ScanRequest {
    card_no: String,
}

#[derive(Debug, Deserialize)]
struct SelectRequest {
    card_no: String,
    locker_id: i64,
}

#[derive(Debug, Serialize)]
struct ScanResponse {
    outcome: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    locker_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    kiosk_id: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    available: Vec<i64>,
}

async fn rfid_scan(
    State(app): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(request): Json<ScanRequest>,
) -> Result<Json<ScanResponse>, AppError> {
    check_origin(&headers, peer.ip())?;

    let outcome = app.flow.handle_scan(&request.card_no).await?;
    Ok(Json(match outcome {
        crate::flows::ScanOutcome::DuplicateIgnored => ScanResponse {
            outcome: "duplicate_ignored",
            locker_id: None,
            kiosk_id: None,
            available: vec![],
        },
        crate::flows::ScanOutcome::Released { locker_id } => ScanResponse {
            outcome: "released",
            locker_id: Some(locker_id),
            kiosk_id: None,
            available: vec![],
        },
        crate::flows::ScanOutcome::VipOpened { locker_id } => ScanResponse {
            outcome: "vip_opened",
            locker_id: Some(locker_id),
            kiosk_id: None,
            available: vec![],
        },
        crate::flows::ScanOutcome::OtherKiosk { kiosk_id, locker_id } => ScanResponse {
            outcome: "other_kiosk",
            locker_id: Some(locker_id),
            kiosk_id: Some(kiosk_id),
            available: vec![],
        },
        crate::flows::ScanOutcome::SessionOpened { available } => ScanResponse {
            outcome: "session_opened",
            locker_id: None,
            kiosk_id: None,
            available,
        },
    }))
}

async fn rfid_select(
    State(app): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(request): Json<SelectRequest>,
) -> Result<Json<ScanResponse>, AppError> {
    check_origin(&headers, peer.ip())?;

    let locker_id = app
        .flow
        .handle_selection(&request.card_no, request.locker_id)
        .await?;
    Ok(Json(ScanResponse {
        outcome: "assigned",
        locker_id: Some(locker_id),
        kiosk_id: None,
        available: vec![],
    }))
}

// ── POST /pin/open ───────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct PinRequest {
    pin: String,
    locker_id: i64,
}

/// Staff override at the kiosk itself: the master PIN opens any locker
/// without touching ownership. Attempts count against the per-kiosk PIN
/// window whether or not the PIN is right.
async fn pin_open(
    State(app): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(request): Json<PinRequest>,
) -> Result<Json<ActResponse>, AppError> {
    check_origin(&headers, peer.ip())?;
    app.limiter
        .check(&ratelimit::master_pin_key(&app.kiosk_id), MASTER_PIN)?;

    let Some(expected) = &app.master_pin else {
        return Err(AppError::Forbidden {
            code: "pin_disabled",
            message: "PIN girişi kapalı".to_owned(),
        });
    };
    if expected
        .as_bytes()
        .ct_eq(request.pin.as_bytes())
        .unwrap_u8()
        != 1
    {
        warn!(kiosk_id = %app.kiosk_id, locker_id = request.locker_id, "bad master PIN");
        return Err(AppError::Forbidden {
            code: "bad_pin",
            message: "Hatalı PIN".to_owned(),
        });
    }

    let locker = app.state.get(&app.kiosk_id, request.locker_id).await?;
    let snapshot = app.config.snapshot().await;
    let coil = zone::resolve(&snapshot, request.locker_id)
        .map_err(|e| AppError::Conflict(e.to_string()))?;
    app.driver.pulse(coil).await.map_err(AppError::from)?;

    app.events
        .append(
            NewEvent::new(EventType::StaffOpen)
                .kiosk(&app.kiosk_id)
                .locker(request.locker_id)
                .staff("master_pin"),
        )
        .await
        .map_err(|e| AppError::Internal(e.to_string()))?;

    info!(kiosk_id = %app.kiosk_id, locker_id = request.locker_id, "master PIN open");
    Ok(Json(ActResponse {
        success: true,
        action: "open",
        message: format!("{} açıldı", locker.label()),
        locker_id: request.locker_id,
    }))
}

// ── GET /health ──────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    kiosk_zone: Option<String>,
    database: DatabaseHealth,
    hardware: crate::driver::DriverHealth,
    uptime_secs: u64,
    version: &'static str,
}

#[derive(Debug, Serialize)]
struct DatabaseHealth {
    status: &'static str,
    last_write: Option<chrono::DateTime<Utc>>,
}

async fn health(State(app): State<Arc<AppState>>) -> Json<HealthResponse> {
    let db_ok = app.db.healthy().await;
    let hardware = app.driver.health().await;
    let status = if !db_ok {
        "error"
    } else if hardware.degraded {
        "degraded"
    } else {
        "ok"
    };

    Json(HealthResponse {
        status,
        kiosk_zone: app.kiosk_zone.clone(),
        database: DatabaseHealth {
            status: if db_ok { "ok" } else { "error" },
            last_write: app.db.last_write().await.ok().flatten(),
        },
        hardware,
        uptime_secs: app.started_at.elapsed().as_secs(),
        version: VERSION,
    })
}

// ── Request plumbing ─────────────────────────────────────────────────

/// Extract a plausible `device_id` cookie: 32 hex characters.
fn device_id_from(headers: &HeaderMap) -> Option<String> {
    let cookies = headers.get(header::COOKIE)?.to_str().ok()?;
    for pair in cookies.split(';') {
        let pair = pair.trim();
        if let Some(value) = pair.strip_prefix("device_id=") {
            if value.len() == 32 && value.chars().all(|c| c.is_ascii_hexdigit()) {
                return Some(value.to_owned());
            }
        }
    }
    None
}

fn device_cookie(device_id: &str) -> String {
    format!(
        "device_id={device_id}; Max-Age={DEVICE_COOKIE_MAX_AGE_SECS}; Path=/; HttpOnly; SameSite=Strict"
    )
}

/// Reject requests from outside the LAN and cross-origin requests.
fn check_origin(headers: &HeaderMap, peer: IpAddr) -> Result<(), AppError> {
    if !is_private(peer) {
        return Err(AppError::Forbidden {
            code: "foreign_network",
            message: "Yerel ağ dışından erişim engellendi".to_owned(),
        });
    }

    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(host_only);

    for name in [header::ORIGIN, header::REFERER] {
        if let Some(value) = headers.get(&name).and_then(|v| v.to_str().ok()) {
            let origin_host = host_only(url_host(value));
            if host.as_deref() != Some(origin_host.as_str()) {
                return Err(AppError::Forbidden {
                    code: "cross_origin",
                    message: "Yerel ağ dışından erişim engellendi".to_owned(),
                });
            }
        }
    }
    Ok(())
}

fn is_private(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_private() || v4.is_loopback() || v4.is_link_local()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                // Unique-local fc00::/7 and link-local fe80::/10.
                || (v6.segments()[0] & 0xfe00) == 0xfc00
                || (v6.segments()[0] & 0xffc0) == 0xfe80
        }
    }
}

/// Strip the scheme and path from an Origin/Referer value.
fn url_host(value: &str) -> &str {
    let after_scheme = value
        .split_once("://")
        .map_or(value, |(_, rest)| rest);
    after_scheme
        .split_once('/')
        .map_or(after_scheme, |(host, _)| host)
}

/// Drop the port from `host:port`.
fn host_only(value: impl AsRef<str>) -> String {
    let value = value.as_ref();
    value
        .rsplit_once(':')
        .filter(|(_, port)| port.chars().all(|c| c.is_ascii_digit()))
        .map_or(value, |(host, _)| host)
        .to_owned()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn device_cookie_roundtrip() {
        let id = kabin_core::qr::generate_device_id();
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_str(&format!("theme=dark; device_id={id}; lang=tr")).unwrap(),
        );
        assert_eq!(device_id_from(&headers), Some(id));
    }

    #[test]
    fn malformed_device_cookie_is_ignored() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("device_id=not-hex-at-all"),
        );
        assert_eq!(device_id_from(&headers), None);
    }

    #[test]
    fn private_addresses_pass() {
        assert!(is_private("192.168.1.10".parse().unwrap()));
        assert!(is_private("10.0.0.1".parse().unwrap()));
        assert!(is_private("172.20.0.3".parse().unwrap()));
        assert!(is_private("127.0.0.1".parse().unwrap()));
        assert!(!is_private("8.8.8.8".parse().unwrap()));
        assert!(!is_private("2001:4860:4860::8888".parse().unwrap()));
    }

    #[test]
    fn origin_must_match_host() {
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, HeaderValue::from_static("192.168.1.5:8081"));
        headers.insert(
            header::ORIGIN,
            HeaderValue::from_static("http://192.168.1.5:8081"),
        );
        check_origin(&headers, "192.168.1.20".parse().unwrap()).unwrap();

        headers.insert(
            header::ORIGIN,
            HeaderValue::from_static("http://evil.example.com"),
        );
        assert!(check_origin(&headers, "192.168.1.20".parse().unwrap()).is_err());
    }

    #[test]
    fn public_peer_is_rejected_regardless_of_headers() {
        let headers = HeaderMap::new();
        assert!(check_origin(&headers, "203.0.113.7".parse().unwrap()).is_err());
    }

    #[test]
    fn url_host_strips_scheme_and_path() {
        assert_eq!(url_host("http://192.168.1.5:8081/lock/3"), "192.168.1.5:8081");
        assert_eq!(url_host("192.168.1.5"), "192.168.1.5");
        assert_eq!(host_only("192.168.1.5:8081"), "192.168.1.5");
        assert_eq!(host_only("192.168.1.5"), "192.168.1.5");
    }
}
