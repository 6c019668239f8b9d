//! mDNS announcement of topic members
//!
//! A broadcaster advertises one service instance per joined topic. The TXT
//! record never carries the topic itself, only a discovery key derived from
//! it, so listeners can match without the key leaking onto the LAN.
//!
//! # TXT record keys
//!
//! | Key  | Value                                          |
//! |------|------------------------------------------------|
//! | `dk` | First 32 hex chars of SHA-256(topic)           |
//! | `id` | Node identity, 64 hex chars                    |
//! | `v`  | Protocol version                               |

use anyhow::Result;
use mdns_sd::{ServiceDaemon, ServiceInfo};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::net::IpAddr;
use swarmcast_core::{PeerIdentity, TopicKey};
use thiserror::Error;
use tracing::{info, warn};

pub const PROTOCOL_VERSION: &str = "1";

/// Hex chars of the topic digest carried in the TXT record
const DISCOVERY_KEY_LEN: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AnnouncementError {
    #[error("missing TXT key '{0}'")]
    Missing(&'static str),
    #[error("invalid identity: {0}")]
    Identity(String),
    #[error("unsupported protocol version '{0}'")]
    Version(String),
}

pub fn discovery_key(topic: &TopicKey) -> String {
    let digest = Sha256::digest(topic.as_bytes());
    let mut key = hex::encode(digest);
    key.truncate(DISCOVERY_KEY_LEN);
    key
}

/// What a node publishes for one topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicAnnouncement {
    pub discovery_key: String,
    pub identity: PeerIdentity,
    pub version: String,
}

impl TopicAnnouncement {
    pub fn new(topic: &TopicKey, identity: PeerIdentity) -> Self {
        Self {
            discovery_key: discovery_key(topic),
            identity,
            version: PROTOCOL_VERSION.to_string(),
        }
    }

    pub fn matches(&self, topic: &TopicKey) -> bool {
        self.discovery_key == discovery_key(topic)
    }

    pub fn to_txt_record(&self) -> HashMap<String, String> {
        let mut record = HashMap::new();
        record.insert("dk".to_string(), self.discovery_key.clone());
        record.insert("id".to_string(), self.identity.to_hex());
        record.insert("v".to_string(), self.version.clone());
        record
    }

    pub fn from_txt_record(record: &HashMap<String, String>) -> Result<Self, AnnouncementError> {
        let discovery_key = record.get("dk").ok_or(AnnouncementError::Missing("dk"))?;
        let identity = record
            .get("id")
            .ok_or(AnnouncementError::Missing("id"))?
            .parse::<PeerIdentity>()
            .map_err(|e| AnnouncementError::Identity(e.to_string()))?;
        let version = record
            .get("v")
            .cloned()
            .unwrap_or_else(|| PROTOCOL_VERSION.to_string());
        if version != PROTOCOL_VERSION {
            return Err(AnnouncementError::Version(version));
        }
        Ok(Self {
            discovery_key: discovery_key.clone(),
            identity,
            version,
        })
    }
}

/// A resolved remote announcement with its reachable addresses
#[derive(Debug, Clone)]
pub struct DiscoveredPeer {
    pub announcement: TopicAnnouncement,
    pub addresses: Vec<IpAddr>,
    pub port: u16,
}

impl DiscoveredPeer {
    pub fn from_service_info(info: &ServiceInfo) -> Result<Self, AnnouncementError> {
        let record: HashMap<String, String> = info
            .get_properties()
            .iter()
            .map(|p| (p.key().to_string(), p.val_str().to_string()))
            .collect();
        let announcement = TopicAnnouncement::from_txt_record(&record)?;
        let mut addresses: Vec<IpAddr> = info.get_addresses().iter().copied().collect();
        // Prefer IPv4; link-local v6 needs a scope id we do not carry
        addresses.sort_by_key(|a| !a.is_ipv4());
        Ok(Self {
            announcement,
            addresses,
            port: info.get_port(),
        })
    }
}

pub fn local_hostname() -> String {
    let raw = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "swarmcast".to_owned());
    format!("{raw}.local.")
}

/// Register `announcement` on `daemon`; returns the service fullname
pub fn advertise(
    daemon: &ServiceDaemon,
    service_type: &str,
    announcement: &TopicAnnouncement,
    host_ip: IpAddr,
    port: u16,
) -> Result<String> {
    let instance = format!(
        "swarmcast-{}-{}",
        announcement.identity.short(),
        &announcement.discovery_key[..8.min(announcement.discovery_key.len())]
    );
    let service = ServiceInfo::new(
        service_type,
        &instance,
        &local_hostname(),
        host_ip,
        port,
        Some(announcement.to_txt_record()),
    )?
    .enable_addr_auto();

    let fullname = service.get_fullname().to_owned();
    daemon.register(service)?;
    info!("[mDNS] Advertising '{}' at {}:{}", instance, host_ip, port);
    Ok(fullname)
}

pub fn withdraw(daemon: &ServiceDaemon, fullname: &str) {
    if let Err(e) = daemon.unregister(fullname) {
        warn!("[mDNS] Failed to unregister '{}': {}", fullname, e);
    } else {
        info!("[mDNS] Advertisement '{}' removed", fullname);
    }
}

/// Primary LAN IPv4 address, found by asking the routing table
pub fn detect_local_ip() -> IpAddr {
    std::net::UdpSocket::bind("0.0.0.0:0")
        .and_then(|s| {
            s.connect("8.8.8.8:80")?;
            s.local_addr()
        })
        .map(|a| a.ip())
        .unwrap_or_else(|_| IpAddr::V4(std::net::Ipv4Addr::LOCALHOST))
}
