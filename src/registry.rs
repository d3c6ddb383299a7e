//! In-memory rendezvous registry: device table, connect-request table, and
//! the HTTP surface (`/api`, `/stats`, `/health`) that serves them (spec
//! §4.6, C6).

use std::collections::HashMap;
use std::io::Read;
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::config::RegistryConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Addr {
    pub ip: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize)]
struct DeviceRecord {
    device_id: String,
    public_addr: Addr,
    local_addr: Option<Addr>,
    #[serde(skip)]
    last_seen: Instant,
    #[serde(skip)]
    registered_at: Instant,
}

#[derive(Debug, Clone, Serialize)]
struct ConnectRequest {
    target_id: String,
    requester_id: String,
    requester_info: Value,
    #[serde(skip)]
    timestamp: Instant,
}

struct RegistryState {
    devices: HashMap<String, DeviceRecord>,
    requests: HashMap<String, Vec<ConnectRequest>>,
}

/// In-memory device registry with an expiry sweep, mirroring spec §4.6.
pub struct DeviceRegistry {
    state: Mutex<RegistryState>,
    config: RegistryConfig,
}

impl DeviceRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        DeviceRegistry {
            state: Mutex::new(RegistryState {
                devices: HashMap::new(),
                requests: HashMap::new(),
            }),
            config,
        }
    }

    /// Upsert a device, preserving `registered_at` across re-registration.
    pub fn register(&self, device_id: &str, public_addr: Addr, local_addr: Option<Addr>) {
        let mut state = self.state.lock().unwrap();
        let now = Instant::now();
        let registered_at = state
            .devices
            .get(device_id)
            .map(|d| d.registered_at)
            .unwrap_or(now);

        state.devices.insert(
            device_id.to_string(),
            DeviceRecord {
                device_id: device_id.to_string(),
                public_addr,
                local_addr,
                last_seen: now,
                registered_at,
            },
        );
    }

    /// Returns the record if present and not expired; expired entries are removed.
    pub fn lookup(&self, device_id: &str) -> Option<(Addr, Option<Addr>)> {
        let mut state = self.state.lock().unwrap();
        let expiry = self.config.device_expiry;

        let expired = state
            .devices
            .get(device_id)
            .map(|d| d.last_seen.elapsed() > expiry)
            .unwrap_or(false);

        if expired {
            state.devices.remove(device_id);
            return None;
        }

        state
            .devices
            .get(device_id)
            .map(|d| (d.public_addr.clone(), d.local_addr.clone()))
    }

    pub fn heartbeat(&self, device_id: &str) -> bool {
        let mut state = self.state.lock().unwrap();
        if let Some(d) = state.devices.get_mut(device_id) {
            d.last_seen = Instant::now();
            true
        } else {
            false
        }
    }

    pub fn unregister(&self, device_id: &str) -> bool {
        self.state.lock().unwrap().devices.remove(device_id).is_some()
    }

    /// Both `requester_id` and `target_id` must be registered and unexpired.
    /// Deduplicates by requester (a later request replaces an earlier one
    /// from the same requester) and returns the target's address record.
    /// `requester_info` (the addresses the target will dial back) is built
    /// from the requester's own registered record, not supplied by the
    /// caller — the rendezvous is the only party that knows both sides'
    /// addresses.
    pub fn connect_request(
        &self,
        requester_id: &str,
        target_id: &str,
    ) -> Option<(Addr, Option<Addr>)> {
        let mut state = self.state.lock().unwrap();
        let expiry = self.config.device_expiry;

        let requester = state
            .devices
            .get(requester_id)
            .filter(|d| d.last_seen.elapsed() <= expiry)
            .map(|d| (d.public_addr.clone(), d.local_addr.clone()));
        let target = state
            .devices
            .get(target_id)
            .filter(|d| d.last_seen.elapsed() <= expiry)
            .map(|d| (d.public_addr.clone(), d.local_addr.clone()));

        let Some((requester_public, requester_local)) = requester else {
            return None;
        };
        if target.is_none() {
            return None;
        }

        let requester_info = json!({
            "device_id": requester_id,
            "public_addr": addr_to_json(&requester_public),
            "local_addr": requester_local.as_ref().map(addr_to_json),
        });

        let entry = state.requests.entry(target_id.to_string()).or_default();
        entry.retain(|r| r.requester_id != requester_id);
        entry.push(ConnectRequest {
            target_id: target_id.to_string(),
            requester_id: requester_id.to_string(),
            requester_info,
            timestamp: Instant::now(),
        });

        target
    }

    /// Non-expired pending requests for `device_id`; expired entries are trimmed in place.
    pub fn get_connect_requests(&self, device_id: &str) -> Vec<(String, Value)> {
        let mut state = self.state.lock().unwrap();
        let expiry = self.config.request_expiry;

        if let Some(list) = state.requests.get_mut(device_id) {
            list.retain(|r| r.timestamp.elapsed() <= expiry);
            let out = list
                .iter()
                .map(|r| (r.requester_id.clone(), r.requester_info.clone()))
                .collect();
            if list.is_empty() {
                state.requests.remove(device_id);
            }
            out
        } else {
            Vec::new()
        }
    }

    pub fn clear_connect_request(&self, target_id: &str, requester_id: &str) -> bool {
        let mut state = self.state.lock().unwrap();
        if let Some(list) = state.requests.get_mut(target_id) {
            let before = list.len();
            list.retain(|r| r.requester_id != requester_id);
            let removed = list.len() != before;
            if list.is_empty() {
                state.requests.remove(target_id);
            }
            removed
        } else {
            false
        }
    }

    pub fn stats(&self) -> Value {
        let state = self.state.lock().unwrap();
        let expiry = self.config.device_expiry;
        let active = state
            .devices
            .values()
            .filter(|d| d.last_seen.elapsed() <= expiry)
            .count();

        json!({
            "total_registered": state.devices.len(),
            "active_devices": active,
            "expiration_seconds": expiry.as_secs(),
        })
    }

    /// Remove expired devices and prune stale per-target request lists.
    /// Intended to be called from a periodic background sweep.
    fn sweep(&self) {
        let mut state = self.state.lock().unwrap();
        let device_expiry = self.config.device_expiry;
        let request_expiry = self.config.request_expiry;

        state
            .devices
            .retain(|_, d| d.last_seen.elapsed() <= device_expiry);

        state.requests.retain(|_, list| {
            list.retain(|r| r.timestamp.elapsed() <= request_expiry);
            !list.is_empty()
        });
    }

    /// Spawn the background sweep loop on its own thread.
    pub fn spawn_sweeper(self: &std::sync::Arc<Self>) {
        let registry = self.clone();
        let interval = self.config.sweep_interval;
        thread::spawn(move || loop {
            thread::sleep(interval);
            registry.sweep();
        });
    }
}

fn addr_from_json(v: &Value) -> Option<Addr> {
    let ip = v.get("ip")?.as_str()?.to_string();
    let port = v.get("port")?.as_u64()? as u16;
    Some(Addr { ip, port })
}

fn addr_to_json(addr: &Addr) -> Value {
    json!({"ip": addr.ip, "port": addr.port})
}

/// Dispatch one `/api` request body against the registry, returning
/// `(status_code, body_json)`.
pub fn handle_api_request(registry: &DeviceRegistry, body: &Value) -> (u16, Value) {
    let action = match body.get("action").and_then(Value::as_str) {
        Some(a) => a,
        None => return (400, json!({"error": "Missing action"})),
    };

    match action {
        "register" => {
            let device_id = match body.get("device_id").and_then(Value::as_str) {
                Some(d) => d,
                None => return (400, json!({"error": "Missing device_id"})),
            };
            let public_addr = match body.get("public_addr").and_then(addr_from_json) {
                Some(a) => a,
                None => return (400, json!({"error": "Missing public_addr"})),
            };
            let local_addr = body.get("local_addr").and_then(addr_from_json);
            registry.register(device_id, public_addr, local_addr);
            (200, json!({"status": "ok", "device_id": device_id}))
        }
        "lookup" => {
            let device_id = match body.get("device_id").and_then(Value::as_str) {
                Some(d) => d,
                None => return (400, json!({"error": "Missing device_id"})),
            };
            match registry.lookup(device_id) {
                Some((public_addr, local_addr)) => (
                    200,
                    json!({
                        "status": "ok",
                        "device_info": {
                            "device_id": device_id,
                            "public_addr": addr_to_json(&public_addr),
                            "local_addr": local_addr.as_ref().map(addr_to_json),
                        }
                    }),
                ),
                None => (404, json!({"status": "not_found", "error": "Device not found or expired"})),
            }
        }
        "heartbeat" => {
            let device_id = match body.get("device_id").and_then(Value::as_str) {
                Some(d) => d,
                None => return (400, json!({"error": "Missing device_id"})),
            };
            if registry.heartbeat(device_id) {
                (200, json!({"status": "ok"}))
            } else {
                (404, json!({"error": "Device not registered"}))
            }
        }
        "unregister" => {
            let device_id = match body.get("device_id").and_then(Value::as_str) {
                Some(d) => d,
                None => return (400, json!({"error": "Missing device_id"})),
            };
            if registry.unregister(device_id) {
                (200, json!({"status": "ok"}))
            } else {
                (404, json!({"error": "Device not registered"}))
            }
        }
        "connect_request" => {
            let requester_id = match body.get("requester_id").and_then(Value::as_str) {
                Some(d) => d,
                None => return (400, json!({"error": "Missing requester_id"})),
            };
            let target_id = match body.get("target_id").and_then(Value::as_str) {
                Some(d) => d,
                None => return (400, json!({"error": "Missing target_id"})),
            };
            match registry.connect_request(requester_id, target_id) {
                Some((public_addr, local_addr)) => (
                    200,
                    json!({
                        "status": "ok",
                        "target_info": {
                            "device_id": target_id,
                            "public_addr": addr_to_json(&public_addr),
                            "local_addr": local_addr.as_ref().map(addr_to_json),
                        }
                    }),
                ),
                None => (404, json!({"status": "not_found", "error": "Requester or target not registered"})),
            }
        }
        "get_connect_requests" => {
            let device_id = match body.get("device_id").and_then(Value::as_str) {
                Some(d) => d,
                None => return (400, json!({"error": "Missing device_id"})),
            };
            let requests: Vec<Value> = registry
                .get_connect_requests(device_id)
                .into_iter()
                .map(|(requester_id, info)| json!({"requester_id": requester_id, "requester_info": info}))
                .collect();
            (200, json!({"status": "ok", "requests": requests}))
        }
        "clear_connect_request" => {
            let target_id = match body.get("target_id").and_then(Value::as_str) {
                Some(d) => d,
                None => return (400, json!({"error": "Missing target_id"})),
            };
            let requester_id = match body.get("requester_id").and_then(Value::as_str) {
                Some(d) => d,
                None => return (400, json!({"error": "Missing requester_id"})),
            };
            registry.clear_connect_request(target_id, requester_id);
            (200, json!({"status": "ok"}))
        }
        _ => (400, json!({"error": "Unknown action"})),
    }
}

/// Serve the registry over HTTP on `host:port` until the process exits.
/// Blocks the calling thread; callers that want a background server should
/// spawn this on its own thread.
pub fn serve(registry: std::sync::Arc<DeviceRegistry>, host: &str, port: u16) -> Result<(), String> {
    let server = tiny_http::Server::http(format!("{host}:{port}"))
        .map_err(|e| format!("failed to bind rendezvous server: {e}"))?;

    log::info!("rendezvous registry listening on {host}:{port}");
    registry.spawn_sweeper();

    for mut request in server.incoming_requests() {
        let url = request.url().to_string();
        let method = request.method().clone();

        let response = match (&method, url.as_str()) {
            (tiny_http::Method::Get, "/") => tiny_http::Response::from_string(
                json!({"service": "Ghostline Signal Rendezvous Server", "status": "running"})
                    .to_string(),
            ),
            (tiny_http::Method::Get, "/stats") => {
                tiny_http::Response::from_string(registry.stats().to_string())
            }
            (tiny_http::Method::Get, "/health") => {
                tiny_http::Response::from_string(json!({"status": "ok"}).to_string())
            }
            (tiny_http::Method::Post, "/api") => {
                let mut body = String::new();
                let _ = request.as_reader().read_to_string(&mut body);
                match serde_json::from_str::<Value>(&body) {
                    Ok(parsed) => {
                        let (status, resp_body) = handle_api_request(&registry, &parsed);
                        tiny_http::Response::from_string(resp_body.to_string())
                            .with_status_code(status)
                    }
                    Err(_) => tiny_http::Response::from_string(
                        json!({"error": "Invalid JSON"}).to_string(),
                    )
                    .with_status_code(400),
                }
            }
            _ => tiny_http::Response::from_string(json!({"error": "Not found"}).to_string())
                .with_status_code(404),
        };

        let _ = request.respond(response);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(ip: &str, port: u16) -> Addr {
        Addr {
            ip: ip.to_string(),
            port,
        }
    }

    #[test]
    fn register_preserves_registered_at() {
        let registry = DeviceRegistry::new(RegistryConfig::default());
        registry.register("dev-1", addr("1.2.3.4", 100), None);
        let first_registered = registry
            .state
            .lock()
            .unwrap()
            .devices
            .get("dev-1")
            .unwrap()
            .registered_at;

        registry.register("dev-1", addr("1.2.3.4", 200), None);
        let second_registered = registry
            .state
            .lock()
            .unwrap()
            .devices
            .get("dev-1")
            .unwrap()
            .registered_at;

        assert_eq!(first_registered, second_registered);
    }

    #[test]
    fn lookup_missing_device_is_none() {
        let registry = DeviceRegistry::new(RegistryConfig::default());
        assert!(registry.lookup("ghost").is_none());
    }

    #[test]
    fn lookup_expires_and_removes_entry() {
        let config = RegistryConfig {
            device_expiry: Duration::from_millis(50),
            ..RegistryConfig::default()
        };
        let registry = DeviceRegistry::new(config);
        registry.register("dev-1", addr("1.2.3.4", 100), None);
        assert!(registry.lookup("dev-1").is_some());

        thread::sleep(Duration::from_millis(120));
        assert!(registry.lookup("dev-1").is_none());
        assert!(registry.state.lock().unwrap().devices.is_empty());
    }

    #[test]
    fn connect_request_requires_both_sides_registered() {
        let registry = DeviceRegistry::new(RegistryConfig::default());
        registry.register("requester", addr("1.1.1.1", 1), None);
        assert!(registry
            .connect_request("requester", "missing-target")
            .is_none());

        registry.register("target", addr("2.2.2.2", 2), None);
        assert!(registry.connect_request("requester", "target").is_some());
    }

    #[test]
    fn connect_request_carries_requesters_registered_address() {
        let registry = DeviceRegistry::new(RegistryConfig::default());
        registry.register("requester", addr("1.1.1.1", 1), Some(addr("10.0.0.1", 11)));
        registry.register("target", addr("2.2.2.2", 2), None);

        registry.connect_request("requester", "target").unwrap();

        let pending = registry.get_connect_requests("target");
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].0, "requester");
        assert_eq!(pending[0].1["public_addr"]["ip"], "1.1.1.1");
        assert_eq!(pending[0].1["local_addr"]["ip"], "10.0.0.1");
    }

    #[test]
    fn connect_request_dedups_by_requester() {
        let registry = DeviceRegistry::new(RegistryConfig::default());
        registry.register("requester", addr("1.1.1.1", 1), None);
        registry.register("target", addr("2.2.2.2", 2), None);

        registry.connect_request("requester", "target");
        registry.connect_request("requester", "target");

        let pending = registry.get_connect_requests("target");
        assert_eq!(pending.len(), 1);
    }

    #[test]
    fn clear_connect_request_removes_matching_entry() {
        let registry = DeviceRegistry::new(RegistryConfig::default());
        registry.register("requester", addr("1.1.1.1", 1), None);
        registry.register("target", addr("2.2.2.2", 2), None);
        registry.connect_request("requester", "target");

        assert!(registry.clear_connect_request("target", "requester"));
        assert!(registry.get_connect_requests("target").is_empty());
    }

    #[test]
    fn api_dispatch_handles_unknown_action() {
        let registry = DeviceRegistry::new(RegistryConfig::default());
        let (status, body) = handle_api_request(&registry, &json!({"action": "bogus"}));
        assert_eq!(status, 400);
        assert!(body["error"].is_string());
    }
}
