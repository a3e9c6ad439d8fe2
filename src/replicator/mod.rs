use crate::error::ProxyError;
use crate::settings::Settings;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::Notify;

/// Multicast configuration replicator.
///
/// Propagates settings-overlay changes across proxy replicas as small
/// JSON datagrams on an IPv4 multicast group. Delivery is best-effort:
/// every replica applies whatever it receives, convergence is eventual,
/// and a lost datagram is corrected by the next write of the same key.
pub struct Replicator {
    settings: Arc<Settings>,
    group: Ipv4Addr,
    port: u16,
    hostname: String,
    socket: std::sync::Mutex<Option<Arc<UdpSocket>>>,
    started: AtomicBool,
    shutdown: Arc<Notify>,
}

/// Wire format. An absent `value` removes the override for `key`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverrideDatagram {
    pub environment: String,
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    pub hostname: String,
}

/// Outcome of applying one received datagram. Split out of the socket
/// loop so the application rules are testable without a network.
#[derive(Debug, PartialEq, Eq)]
pub enum Applied {
    Set,
    Removed,
    /// Our own transmission echoed back by the group.
    DroppedOwn,
    /// The key is owned by a different environment than the sender named.
    SkippedForeignEnvironment,
    Invalid,
}

pub fn apply_datagram(settings: &Settings, payload: &[u8], local_hostname: &str) -> Applied {
    let msg: OverrideDatagram = match serde_json::from_slice(payload) {
        Ok(m) => m,
        Err(e) => {
            tracing::debug!("replicator: undecodable datagram dropped, error={}", e);
            return Applied::Invalid;
        }
    };

    if msg.hostname == local_hostname {
        return Applied::DroppedOwn;
    }

    if let Some(owner) = settings.owner(&msg.key) {
        if owner != msg.environment {
            tracing::warn!(
                "replicator: key {} is owned by environment {}, sender claimed {}, skipping",
                msg.key,
                owner,
                msg.environment
            );
            return Applied::SkippedForeignEnvironment;
        }
    }

    match msg.value {
        Some(ref value) => {
            settings.set_override(&msg.key, value);
            tracing::info!(
                "replicator: override applied, key={}, from={}",
                msg.key,
                msg.hostname
            );
            Applied::Set
        }
        None => {
            settings.remove_override(&msg.key);
            tracing::info!(
                "replicator: override removed, key={}, from={}",
                msg.key,
                msg.hostname
            );
            Applied::Removed
        }
    }
}

impl Replicator {
    pub fn new(settings: Arc<Settings>, group: Ipv4Addr, port: u16) -> Self {
        Self {
            settings,
            group,
            port,
            hostname: crate::net::local::node_hostname(),
            socket: std::sync::Mutex::new(None),
            started: AtomicBool::new(false),
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Bind the UDP socket, enable broadcast, join the multicast group,
    /// and spawn the receive loop.
    pub async fn start(self: &Arc<Self>) -> Result<(), ProxyError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let bound = async {
            let socket = UdpSocket::bind(("0.0.0.0", self.port))
                .await
                .map_err(|e| ProxyError::Internal(format!("replicator bind failed: {}", e)))?;
            socket
                .set_broadcast(true)
                .map_err(|e| ProxyError::Internal(format!("replicator broadcast flag: {}", e)))?;
            socket
                .join_multicast_v4(self.group, Ipv4Addr::UNSPECIFIED)
                .map_err(|e| ProxyError::Internal(format!("replicator group join: {}", e)))?;
            Ok(socket)
        }
        .await;

        let socket = match bound {
            Ok(s) => Arc::new(s),
            Err(e) => {
                self.started.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };
        *self.socket.lock().unwrap() = Some(socket.clone());

        tracing::info!(
            "replicator: started, group={}, port={}",
            self.group,
            self.port
        );

        let this = self.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 64 * 1024];
            loop {
                tokio::select! {
                    received = socket.recv_from(&mut buf) => {
                        match received {
                            Ok((len, peer)) => {
                                let outcome = apply_datagram(&this.settings, &buf[..len], &this.hostname);
                                metrics::counter!(
                                    "proxy_replicator_received_total",
                                    "outcome" => outcome_label(&outcome),
                                )
                                .increment(1);
                                tracing::debug!(
                                    "replicator: datagram from {}, outcome={:?}",
                                    peer,
                                    outcome
                                );
                            }
                            Err(e) => {
                                tracing::warn!("replicator: recv error, error={}", e);
                            }
                        }
                    }
                    _ = this.shutdown.notified() => {
                        tracing::info!("replicator: receive loop stopped");
                        return;
                    }
                }
            }
        });

        Ok(())
    }

    /// Broadcast one override change to the group. Requires a started
    /// replicator; transmission failures are logged and swallowed.
    pub async fn send(
        &self,
        environment: &str,
        key: &str,
        value: Option<&str>,
    ) -> Result<(), ProxyError> {
        if !self.started.load(Ordering::SeqCst) {
            return Err(ProxyError::Internal(
                "replicator send before start".to_string(),
            ));
        }
        let socket = {
            let guard = self.socket.lock().unwrap();
            match guard.as_ref() {
                Some(s) => s.clone(),
                None => {
                    return Err(ProxyError::Internal(
                        "replicator send before start".to_string(),
                    ))
                }
            }
        };

        let msg = OverrideDatagram {
            environment: environment.to_string(),
            key: key.to_string(),
            value: value.map(|v| v.to_string()),
            hostname: self.hostname.clone(),
        };
        let payload = match serde_json::to_vec(&msg) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!("replicator: encode failed, key={}, error={}", key, e);
                return Ok(());
            }
        };

        match socket.send_to(&payload, (self.group, self.port)).await {
            Ok(_) => {
                metrics::counter!("proxy_replicator_sent_total").increment(1);
            }
            Err(e) => {
                tracing::warn!("replicator: send failed, key={}, error={}", key, e);
            }
        }
        Ok(())
    }

    /// Set an override locally and replicate it to the group.
    pub async fn publish_override(
        &self,
        environment: &str,
        key: &str,
        value: &str,
    ) -> Result<(), ProxyError> {
        self.settings.set_override(key, value);
        self.send(environment, key, Some(value)).await
    }

    /// Remove an override locally and replicate the removal.
    pub async fn publish_reset(&self, environment: &str, key: &str) -> Result<(), ProxyError> {
        self.settings.remove_override(key);
        self.send(environment, key, None).await
    }

    /// Stop the receive loop and release the socket.
    pub fn stop(&self) {
        if !self.started.swap(false, Ordering::SeqCst) {
            return;
        }
        self.shutdown.notify_waiters();
        *self.socket.lock().unwrap() = None;
        tracing::info!("replicator: stopped");
    }

    /// Schedule a hard close after `grace`. Lets in-flight sends finish
    /// while guaranteeing the socket goes away.
    pub fn stop_in_background(self: &Arc<Self>, grace: std::time::Duration) {
        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            this.stop();
        });
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }
}

fn outcome_label(outcome: &Applied) -> &'static str {
    match outcome {
        Applied::Set => "set",
        Applied::Removed => "removed",
        Applied::DroppedOwn => "dropped_own",
        Applied::SkippedForeignEnvironment => "skipped",
        Applied::Invalid => "invalid",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn settings() -> Arc<Settings> {
        Settings::from_map(HashMap::new())
    }

    fn datagram(environment: &str, key: &str, value: Option<&str>, hostname: &str) -> Vec<u8> {
        serde_json::to_vec(&OverrideDatagram {
            environment: environment.to_string(),
            key: key.to_string(),
            value: value.map(|v| v.to_string()),
            hostname: hostname.to_string(),
        })
        .unwrap()
    }

    #[test]
    fn test_apply_sets_override() {
        let s = settings();
        s.claim("safety", "HATE_LAN_ACCESS").unwrap();

        let outcome = apply_datagram(
            &s,
            &datagram("safety", "HATE_LAN_ACCESS", Some("true"), "node-a"),
            "node-b",
        );
        assert_eq!(outcome, Applied::Set);
        assert!(s.bool_or("HATE_LAN_ACCESS", false));
    }

    #[test]
    fn test_apply_absent_value_removes_override() {
        let s = settings();
        s.set_override("HATE_LAN_ACCESS", "true");

        let outcome = apply_datagram(
            &s,
            &datagram("safety", "HATE_LAN_ACCESS", None, "node-a"),
            "node-b",
        );
        assert_eq!(outcome, Applied::Removed);
        assert!(s.override_value("HATE_LAN_ACCESS").is_none());
    }

    #[test]
    fn test_own_hostname_dropped() {
        let s = settings();
        let outcome = apply_datagram(
            &s,
            &datagram("safety", "HATE_LAN_ACCESS", Some("true"), "node-a"),
            "node-a",
        );
        assert_eq!(outcome, Applied::DroppedOwn);
        assert!(s.override_value("HATE_LAN_ACCESS").is_none());
    }

    #[test]
    fn test_foreign_environment_skipped() {
        let s = settings();
        s.claim("safety", "HATE_LAN_ACCESS").unwrap();

        let outcome = apply_datagram(
            &s,
            &datagram("guard", "HATE_LAN_ACCESS", Some("true"), "node-a"),
            "node-b",
        );
        assert_eq!(outcome, Applied::SkippedForeignEnvironment);
        assert!(s.override_value("HATE_LAN_ACCESS").is_none());
    }

    #[test]
    fn test_garbage_datagram_is_invalid() {
        let s = settings();
        assert_eq!(apply_datagram(&s, b"not json", "node-b"), Applied::Invalid);
    }

    #[tokio::test]
    async fn test_send_requires_started() {
        let rep = Arc::new(Replicator::new(settings(), "224.0.0.3".parse().unwrap(), 5799));
        assert!(rep.send("safety", "HATE_LAN_ACCESS", Some("true")).await.is_err());
    }

    /// End-to-end multicast loop. Depends on a multicast-capable
    /// interface, so it is opt-in.
    #[tokio::test]
    #[ignore = "requires a multicast-capable network interface"]
    async fn test_multicast_round_trip() {
        let s = settings();
        s.claim("safety", "HATE_LAN_ACCESS").unwrap();

        let group: Ipv4Addr = "224.0.0.3".parse().unwrap();
        let receiver = Arc::new(Replicator::new(s.clone(), group, 5801));
        receiver.start().await.unwrap();

        // Transmit from a plain ephemeral socket, as a peer node would.
        let sender = UdpSocket::bind(("0.0.0.0", 0)).await.unwrap();
        let payload = datagram("safety", "HATE_LAN_ACCESS", Some("true"), "other-node");
        sender.send_to(&payload, (group, 5801)).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        assert!(s.bool_or("HATE_LAN_ACCESS", false));

        receiver.stop();
    }
}
