//! Forward authorization policy.
//!
//! Consulted for every forward negotiation request from a peer. Local
//! forwards (sandbox dialing out through the host) are restricted to an
//! allowlist of destination hosts, loopback by default, plus an
//! optional port allowlist; an empty port list accepts any
//! non-privileged port. Privileged ports are rejected outright for
//! everything negotiated at runtime. Violations surface as handler
//! `ok:false` responses, never as connection failures.

use serde::Deserialize;
use std::collections::HashSet;
use tether_core::forward::PRIVILEGED_PORT_MAX;
use tether_core::DialGuard;

/// Static policy rules, as written in the `[policy]` config section.
///
/// `allowed_hosts` supports the wildcard `"*"`; an empty list means
/// loopback only. `allowed_ports` empty means any non-privileged port.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ForwardPolicy {
    #[serde(default)]
    pub allowed_hosts: Vec<String>,
    #[serde(default)]
    pub allowed_ports: Vec<u16>,
}

/// Runtime counterpart of [`ForwardPolicy`] with pre-computed sets.
pub struct PolicyEnforcer {
    hosts: HashSet<String>,
    ports: HashSet<u16>,
    allow_any_host: bool,
}

const LOOPBACK_HOSTS: [&str; 3] = ["127.0.0.1", "localhost", "::1"];

impl PolicyEnforcer {
    pub fn new(policy: ForwardPolicy) -> Self {
        let allow_any_host = policy.allowed_hosts.iter().any(|h| h == "*");
        let mut hosts: HashSet<String> = policy.allowed_hosts.into_iter().collect();
        if hosts.is_empty() {
            hosts.extend(LOOPBACK_HOSTS.iter().map(|s| s.to_string()));
        }
        Self {
            hosts,
            ports: policy.allowed_ports.into_iter().collect(),
            allow_any_host,
        }
    }

    pub fn is_host_allowed(&self, host: &str) -> bool {
        self.allow_any_host || self.hosts.contains(host)
    }

    pub fn is_port_allowed(&self, port: u16) -> bool {
        if port < PRIVILEGED_PORT_MAX {
            return false;
        }
        self.ports.is_empty() || self.ports.contains(&port)
    }
}

impl DialGuard for PolicyEnforcer {
    fn check_dial(&self, host: &str, port: u16) -> Result<(), String> {
        if !self.is_host_allowed(host) {
            return Err(format!("destination host not allowed: {host}"));
        }
        if !self.is_port_allowed(port) {
            return Err(format!("destination port not allowed: {port}"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_loopback_only() {
        let enforcer = PolicyEnforcer::new(ForwardPolicy::default());
        assert!(enforcer.is_host_allowed("127.0.0.1"));
        assert!(enforcer.is_host_allowed("localhost"));
        assert!(!enforcer.is_host_allowed("example.com"));
    }

    #[test]
    fn wildcard_allows_any_host() {
        let enforcer = PolicyEnforcer::new(ForwardPolicy {
            allowed_hosts: vec!["*".into()],
            allowed_ports: Vec::new(),
        });
        assert!(enforcer.is_host_allowed("example.com"));
    }

    #[test]
    fn empty_port_list_accepts_any_non_privileged() {
        let enforcer = PolicyEnforcer::new(ForwardPolicy::default());
        assert!(enforcer.is_port_allowed(8080));
        assert!(enforcer.is_port_allowed(65535));
        assert!(!enforcer.is_port_allowed(80));
        assert!(!enforcer.is_port_allowed(1023));
    }

    #[test]
    fn port_allowlist_is_exclusive() {
        let enforcer = PolicyEnforcer::new(ForwardPolicy {
            allowed_hosts: Vec::new(),
            allowed_ports: vec![5432, 6379],
        });
        assert!(enforcer.is_port_allowed(5432));
        assert!(!enforcer.is_port_allowed(8080));
        // Privileged stays rejected even when listed.
        let strict = PolicyEnforcer::new(ForwardPolicy {
            allowed_hosts: Vec::new(),
            allowed_ports: vec![80],
        });
        assert!(!strict.is_port_allowed(80));
    }

    #[test]
    fn dial_guard_combines_both_checks() {
        let enforcer = PolicyEnforcer::new(ForwardPolicy::default());
        assert!(enforcer.check_dial("127.0.0.1", 8080).is_ok());
        assert!(enforcer.check_dial("10.0.0.1", 8080).is_err());
        assert!(enforcer.check_dial("127.0.0.1", 80).is_err());
    }
}
