//! Stateless HTTP client for the rendezvous registry, plus the heartbeat
//! background task (spec §4.7, C7).

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use serde_json::{json, Value};

use crate::registry::Addr;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);

pub struct RendezvousClient {
    base_url: String,
    http: reqwest::blocking::Client,
    running: Arc<Mutex<bool>>,
}

impl RendezvousClient {
    pub fn new(base_url: &str) -> Self {
        RendezvousClient {
            base_url: base_url.trim_end_matches('/').to_string(),
            http: reqwest::blocking::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .expect("reqwest client builds with a fixed timeout"),
            running: Arc::new(Mutex::new(false)),
        }
    }

    /// Register this device and, on success, start a heartbeat thread that
    /// runs every 60s until [`RendezvousClient::stop_heartbeat`] is called.
    pub fn register_device(
        &self,
        device_id: &str,
        public_addr: &Addr,
        local_addr: Option<&Addr>,
    ) -> bool {
        let body = json!({
            "action": "register",
            "device_id": device_id,
            "public_addr": {"ip": public_addr.ip, "port": public_addr.port},
            "local_addr": local_addr.map(|a| json!({"ip": a.ip, "port": a.port})),
        });

        let ok = self
            .send_request(&body)
            .map(|r| r.get("status").and_then(Value::as_str) == Some("ok"))
            .unwrap_or(false);

        if ok {
            self.start_heartbeat(device_id.to_string(), public_addr.clone(), local_addr.cloned());
        }
        ok
    }

    pub fn lookup_device(&self, device_id: &str) -> Option<Value> {
        let body = json!({"action": "lookup", "device_id": device_id});
        let response = self.send_request(&body)?;
        if response.get("status").and_then(Value::as_str) == Some("ok") {
            response.get("device_info").cloned()
        } else {
            None
        }
    }

    pub fn send_connect_request(&self, requester_id: &str, target_id: &str) -> Option<Value> {
        let body = json!({
            "action": "connect_request",
            "requester_id": requester_id,
            "target_id": target_id,
        });
        let response = self.send_request(&body)?;
        if response.get("status").and_then(Value::as_str) == Some("ok") {
            response.get("target_info").cloned()
        } else {
            None
        }
    }

    pub fn get_connect_requests(&self, device_id: &str) -> Vec<Value> {
        let body = json!({"action": "get_connect_requests", "device_id": device_id});
        self.send_request(&body)
            .and_then(|r| r.get("requests").cloned())
            .and_then(|v| v.as_array().cloned())
            .unwrap_or_default()
    }

    pub fn clear_connect_request(&self, target_id: &str, requester_id: &str) -> bool {
        let body = json!({
            "action": "clear_connect_request",
            "target_id": target_id,
            "requester_id": requester_id,
        });
        self.send_request(&body)
            .map(|r| r.get("status").and_then(Value::as_str) == Some("ok"))
            .unwrap_or(false)
    }

    pub fn unregister_device(&self, device_id: &str) {
        self.stop_heartbeat();
        let body = json!({"action": "unregister", "device_id": device_id});
        let _ = self.send_request(&body);
    }

    pub fn stop_heartbeat(&self) {
        *self.running.lock().unwrap() = false;
    }

    fn start_heartbeat(&self, device_id: String, public_addr: Addr, local_addr: Option<Addr>) {
        *self.running.lock().unwrap() = true;

        let running = self.running.clone();
        let base_url = self.base_url.clone();
        let http = self.http.clone();

        thread::spawn(move || {
            while *running.lock().unwrap() {
                thread::sleep(HEARTBEAT_INTERVAL);
                if !*running.lock().unwrap() {
                    break;
                }

                let body = json!({
                    "action": "heartbeat",
                    "device_id": device_id,
                    "public_addr": {"ip": public_addr.ip, "port": public_addr.port},
                    "local_addr": local_addr.as_ref().map(|a| json!({"ip": a.ip, "port": a.port})),
                });
                let _ = send_request_raw(&http, &base_url, &body);
            }
        });
    }

    /// All failures (network, timeout, malformed response) collapse to `None`.
    fn send_request(&self, body: &Value) -> Option<Value> {
        send_request_raw(&self.http, &self.base_url, body)
    }
}

fn send_request_raw(http: &reqwest::blocking::Client, base_url: &str, body: &Value) -> Option<Value> {
    http.post(format!("{base_url}/api"))
        .json(body)
        .send()
        .ok()?
        .json::<Value>()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unreachable_server_degrades_to_none() {
        let client = RendezvousClient::new("http://127.0.0.1:1");
        assert!(client.lookup_device("anyone").is_none());
        assert!(client
            .send_connect_request("requester", "target")
            .is_none());
        assert!(client.get_connect_requests("anyone").is_empty());
    }

    #[test]
    fn register_against_unreachable_server_returns_false() {
        let client = RendezvousClient::new("http://127.0.0.1:1");
        let addr = Addr {
            ip: "10.0.0.1".to_string(),
            port: 1234,
        };
        assert!(!client.register_device("dev", &addr, None));
    }
}
